//! Utility functions

use crate::error::{DsynthError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

/// Reads the json file and deserializes it into the provided type.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| DsynthError::io(err, path))?;
    let file = std::io::BufReader::new(file);
    let val: T = serde_json::from_reader(file)?;
    Ok(val)
}

/// Serializes the provided value to pretty JSON and writes it to a file.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|err| DsynthError::io(err, path))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| DsynthError::io(err, path))?;
    Ok(())
}

/// Creates the parent directory of the `file` and all its ancestors if it does not exist.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| DsynthError::io(err, parent))?;
    }
    Ok(())
}

/// `fs::create_dir_all` with the path attached on error.
pub fn mkdirs(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|err| DsynthError::io(err, dir))?;
    Ok(())
}

/// Removes a directory tree if it exists.
pub fn remove_dir_if_exists(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if dir.exists() {
        fs::remove_dir_all(dir).map_err(|err| DsynthError::io(err, dir))?;
    }
    Ok(())
}

/// Commits all dirty filesystem buffers to disk.
///
/// Durability barrier between populating the template tree and writing the
/// sentinel that marks it usable.
pub fn sync_filesystems() {
    // SAFETY: sync(2) takes no arguments and cannot fail.
    unsafe { libc::sync() };
}
