pub mod http;

pub use http::HttpProvider;
