pub mod animation;
pub mod backend;
pub mod cli;
pub mod effects;
pub mod kwin;
pub mod output;
pub mod render_helpers;
pub mod scene;
pub mod utils;
pub mod watchdog;
pub mod window;

#[cfg(test)]
mod tests;
