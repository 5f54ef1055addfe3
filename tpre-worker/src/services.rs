//! Internal services of the worker node.

pub mod keystore;
pub mod kfrag_store;
pub mod rate;
