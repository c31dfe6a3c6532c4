pub mod csv_filter;
pub mod fetch;
pub mod image;
pub mod markdown;
pub mod query;
pub mod transcribe;
pub mod vcs;

pub use csv_filter::CsvFilterOperation;
pub use fetch::{FetchOperation, HttpFetcher, ScrapeOperation};
pub use image::ImageTransformOperation;
pub use markdown::MarkdownRenderOperation;
pub use query::QueryOperation;
pub use transcribe::TranscribeOperation;
pub use vcs::{GitCli, VcsCommitOperation, VersionControlClient};
