//! Core data models for the uploader.
//!
//! These types describe what flows through a transfer: the caller's upload
//! request, the key it lands under, the part plan and session tracking for
//! multipart transfers, listing pages and validation verdicts.

pub mod listing;
pub mod multipart;
pub mod object;
pub mod verdict;

pub use listing::ListingPage;
pub use multipart::{
    CompletedPart, MultipartSession, PartDescriptor, PartPlan, PartRecord, PartStatus,
    SessionState, UploadSession,
};
pub use object::{ByteStream, ObjectDownload, ObjectKey, UploadRequest};
pub use verdict::ValidationVerdict;
