pub mod aggregator;
pub mod auth;
pub mod context;
pub mod fetcher;
mod services;
pub mod transport;
pub mod tree;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use aggregator::{Aggregator, AggregatorBuilder, FetchSettings};
pub use auth::{AuthSession, AuthStatus, CredentialExchange, TokenAuthenticator};
pub use context::{Admission, FetchContext};
pub use fetcher::{FetchedThread, PlatformFetcher};
pub use threadsignal_common::{
    CommentNode, Config, CredentialStore, Credentials, Platform, RawNode, Result, SkipReason,
    ThreadError, ThreadReference, ThreadRequest, ThreadResult,
};
pub use transport::{
    ApiRequest, HttpTransport, RateLimitedTransport, RawResponse, ReqwestTransport,
    RequestBudget, RetryPolicy,
};
pub use tree::{BuiltTree, TreeBuilder};
