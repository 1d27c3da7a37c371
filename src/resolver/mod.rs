//! Dependency resolution for kernel modules and shared libraries.
//!
//! Stages ask these resolvers for transitive closures before placing files:
//! a kernel module pulls in everything `modules.dep` says it needs, and a
//! dynamically linked binary pulls in its shared libraries.

pub mod libraries;
pub mod modules;

pub use libraries::LibraryResolver;
pub use modules::ModuleResolver;
