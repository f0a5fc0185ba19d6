pub mod client;
pub mod response;
pub mod transport;

pub use client::{Download, Page, WebClient};
