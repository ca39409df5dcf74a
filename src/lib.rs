#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod discovery;
pub mod error;
pub mod hostname;
pub mod model;
pub mod prometheus_scrape;
pub mod scraper;
pub mod sink;

pub use config::PrometheusConfig;
pub use discovery::TargetResolver;
pub use error::{GatherError, ParseError};
pub use hostname::extract_host;
pub use model::{NormalizedRecord, ScrapeTarget};
pub use scraper::{GatherReport, Gatherer};
pub use sink::{Accumulator, Sink};
