//! The middle of the compiler: the resolved program handed to the back end.

pub mod sem;
