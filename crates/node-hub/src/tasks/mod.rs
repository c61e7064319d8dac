pub mod flush;
