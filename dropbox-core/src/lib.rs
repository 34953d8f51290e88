mod client;

pub use client::{
    Account, AccountName, ApiErrorClass, DeletedMetadata, DropboxClient, DropboxError,
    FileDownload, FileMetadata, FolderMetadata, FolderSharingInfo, ListFolderResult, Metadata,
    SharedFolder, SharedFolderList, SpaceAllocation, SpaceUsage,
};
