//! The pieces of work the pipeline is assembled from: compiling the Go program, assembling and
//! pushing the runtime image, packaging and pushing the chart, and installing it.

pub mod chart;
pub mod go;
pub mod image;
pub mod install;
