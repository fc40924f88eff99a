mod filename;
mod scheduler;
mod stream;

pub use filename::{
    FilenameAllocator, PARTIAL_SUFFIX, episode_filename, filename_stem, media_extension,
    partial_path,
};
pub use scheduler::{BatchReport, DownloadOptions, DownloadScheduler, select_for_download};
pub use stream::{DownloadContext, DownloadedFile, cleanup_partial_files, download_episode};
