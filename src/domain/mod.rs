//! Domain types shared by the engine, runtime and CLI

pub mod model;
