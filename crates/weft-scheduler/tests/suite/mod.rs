mod harness;
mod incremental;
mod resources;
