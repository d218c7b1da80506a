pub mod code_exec;
pub mod crawl;
pub mod executor;
pub mod inspect;
pub mod rate_limit;
pub mod registry;
pub mod retrieval;
pub mod schema;
pub mod search;

pub use code_exec::CodeExecTool;
pub use crawl::{CrawlTool, PageFetcher, SearchAndCrawlTool};
pub use executor::ToolExecutor;
pub use inspect::{
    CommandConverter, DocumentConverter, FileKind, InspectorContext, MediaDescriber, MediaInspectorTool,
    TextInspectorTool, UnavailableDescriber,
};
pub use rate_limit::{RateLimitGuard, RateLimiter};
pub use registry::{Tool, ToolClass, ToolOutput, ToolRegistry};
pub use retrieval::{Chunker, InMemoryRetrieval, Passage, Retrieval, RetrieverTool};
pub use search::{AggregatedSearch, AggregatedSearchTool, HttpJsonSearchProvider, SearchHit, SearchProvider};
