#[cfg(feature = "gemini")]
pub mod client;
pub mod prompts;
pub mod report;
pub mod retry;
pub mod types;

#[cfg(feature = "gemini")]
pub use client::*;
pub use report::*;
pub use retry::*;
pub use types::*;
