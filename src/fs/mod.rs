pub mod fat;
pub mod ntfs;
