pub mod augment;
pub mod classify;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod gui;
pub mod logging;
pub mod model;
pub mod module;
pub mod preprocess;
pub mod report;
pub mod training;
