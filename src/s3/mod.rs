pub mod batch;
pub mod client;
pub mod compare;
pub mod cursor;
pub mod error;
pub mod helpers;
pub mod memory;
pub mod paginator;
pub mod presign;
pub mod retry;
pub mod signer;
pub mod transport;
pub mod types;
pub mod upload;
pub mod waiter;

mod xml;

pub use batch::BatchDeleter;
pub use client::{ClientStats, S3Client};
pub use compare::FileComparison;
pub use cursor::ContinuationToken;
pub use error::{ErrorKind, Result, StorageError};
pub use helpers::{detect_content_type, parse_metadata};
pub use memory::{Fault, MemoryTransport};
pub use paginator::{ListObjectsPaginator, PaginatorState};
pub use presign::{
    DEFAULT_PRESIGN_EXPIRY, PresignedRequest, generate_presigned_url,
    generate_presigned_url_with_expiry,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use signer::{SigV4Signer, Signer, SigningParams};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport, TransportError};
pub use types::*;
pub use upload::{UploadResult, download_file, sync_file, upload_file};
pub use waiter::{WaitReport, Waiter, WaiterConfig};
