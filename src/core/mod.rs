pub mod config;
pub mod io;
pub mod prefs;
pub mod state;
