//!
//! # gradgen
//!
//! ## Core API
//!
//! Build a forward graph with the `create_*` builders on [`graph::Graph`],
//! then hand it to [`generate`] (or a configured [`Generator`]) to append its
//! backward graph and one SGD update per trainable variable.
//!
//! The pass is all-or-nothing; on error the graph is left untouched
//!

pub use lib_gradgen_core::*;

pub use lib_gradgen_graph as graph;
