//! # Code
//!
//! Machine code snippets written into hooked functions and trampolines

pub mod x64;
