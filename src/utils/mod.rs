pub mod debounce;
pub mod hash;
