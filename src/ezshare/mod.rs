mod client;
mod listing;
mod types;

pub use client::{ClientOptions, EzShareClient, download_url, subdir_url};
pub use listing::parse_listing;
pub use types::{Listing, ListingRules, RemoteDir, RemoteFile, default_renames};
