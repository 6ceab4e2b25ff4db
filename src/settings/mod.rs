pub mod swap;

pub use swap::SwapManager;
