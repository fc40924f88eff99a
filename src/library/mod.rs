mod episode;
mod feed;
mod segment;

pub use episode::{DownloadStatus, Episode, EpisodeMetadata, NewEpisode};
pub use feed::{Feed, FeedDetails, NewFeed, generate_short_name, validate_download_path};
pub use segment::{AdSegment, NewAdSegment, SegmentStatus, SegmentType};
