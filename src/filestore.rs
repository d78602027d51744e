//! Filesystem abstraction used by both handler types and the filestore request
//! execution of the destination handler.
use crate::checksum::{ChecksumComputer, ChecksumRegistry, UnsupportedChecksumType};
use crate::pdu::lv::Lv;
use crate::pdu::tlv::{FilestoreActionCode, FilestoreRequestTlv, FilestoreResponseTlv};
use crate::util::ByteConversionError;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("file does not exist")]
    FileDoesNotExist,
    #[error("file already exists")]
    FileAlreadyExists,
    #[error("directory does not exist")]
    DirDoesNotExist,
    #[error("permission error")]
    Permission,
    #[error("is not a file")]
    IsNotFile,
    #[error("is not a directory")]
    IsNotDirectory,
    #[error("byte conversion: {0}")]
    ByteConversion(#[from] ByteConversionError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum type not implemented: {0}")]
    ChecksumTypeNotImplemented(#[from] UnsupportedChecksumType),
    #[error("utf8 error")]
    Utf8Error,
    #[error("other error")]
    Other,
}

/// Virtual filestore abstraction.
///
/// The handlers never touch the filesystem directly. All file accesses including the
/// whole-file checksum calculation go through this trait, which allows backing the
/// engine with a native filesystem, a flash translation layer or an in-memory store
/// for testing.
pub trait VirtualFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Truncating a file means deleting all its data so the resulting file is empty.
    /// This can be more efficient than removing and re-creating a file.
    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError>;

    /// Append the contents of the second file to the first file.
    fn append_file(&self, file_path: &str, appended_path: &str) -> Result<(), FilestoreError>;

    /// Replace the contents of the first file with the contents of the second file.
    fn replace_file(&self, file_path: &str, source_path: &str) -> Result<(), FilestoreError>;

    fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError>;
    fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError>;

    /// List the full paths of all entries inside a directory, descending into
    /// subdirectories when `recursive` is set. The entry order is unspecified.
    fn list_directory(
        &self,
        dir_path: &str,
        recursive: bool,
    ) -> Result<Vec<String>, FilestoreError>;

    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError>;

    fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError>;

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError>;

    fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(!self.is_file(path)?)
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// CFDP specific abstraction to calculate the checksum of a file by feeding it in
    /// order through the given checksum computer. This keeps OS specific details like
    /// reading the whole file in the most efficient manner inside the file system
    /// abstraction.
    ///
    /// The passed verification buffer will be used to read chunks of the file. It is
    /// recommended to use common buffer sizes like 4096 or 8192 bytes.
    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum: &mut dyn ChecksumComputer,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;

    /// Verify the file against an expected checksum value, using the checksum algorithm
    /// registered for the given type identifier.
    fn checksum_verify(
        &self,
        expected_checksum: u32,
        file_path: &str,
        checksum_type: u8,
        registry: &ChecksumRegistry,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<bool, FilestoreError> {
        let mut computer = registry.create(checksum_type)?;
        Ok(self.calculate_checksum(
            file_path,
            computer.as_mut(),
            size_to_verify,
            verification_buf,
        )? == expected_checksum)
    }
}

/// Filestore implementation backed by [std::fs].
#[derive(Debug, Default, Clone)]
pub struct NativeFilestore {}

impl NativeFilestore {
    fn exists_internal(&self, path: &Path) -> bool {
        path.exists()
    }

    fn check_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        if !self.exists(file_path)? {
            return Err(FilestoreError::FileDoesNotExist);
        }
        if !self.is_file(file_path)? {
            return Err(FilestoreError::IsNotFile);
        }
        Ok(())
    }

    fn list_dir_entries(
        &self,
        dir_path: &Path,
        recursive: bool,
        entries: &mut Vec<String>,
    ) -> Result<(), FilestoreError> {
        for entry in fs::read_dir(dir_path)? {
            let path = entry?.path();
            entries.push(path.to_str().ok_or(FilestoreError::Utf8Error)?.to_string());
            if recursive && path.is_dir() {
                self.list_dir_entries(&path, recursive, entries)?;
            }
        }
        Ok(())
    }
}

impl VirtualFilestore for NativeFilestore {
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        if self.exists(file_path)? {
            return Err(FilestoreError::FileAlreadyExists);
        }
        File::create(file_path)?;
        Ok(())
    }

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.check_file(file_path)?;
        fs::remove_file(file_path)?;
        Ok(())
    }

    fn truncate_file(&self, file_path: &str) -> Result<(), FilestoreError> {
        self.check_file(file_path)?;
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(file_path)?;
        Ok(())
    }

    fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError> {
        self.check_file(old_path)?;
        if self.exists(new_path)? {
            return Err(FilestoreError::FileAlreadyExists);
        }
        fs::rename(old_path, new_path)?;
        Ok(())
    }

    fn append_file(&self, file_path: &str, appended_path: &str) -> Result<(), FilestoreError> {
        self.check_file(file_path)?;
        self.check_file(appended_path)?;
        let mut reader = BufReader::new(File::open(appended_path)?);
        let mut target = OpenOptions::new().append(true).open(file_path)?;
        std::io::copy(&mut reader, &mut target)?;
        Ok(())
    }

    fn replace_file(&self, file_path: &str, source_path: &str) -> Result<(), FilestoreError> {
        self.check_file(file_path)?;
        self.check_file(source_path)?;
        fs::copy(source_path, file_path)?;
        Ok(())
    }

    fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError> {
        fs::create_dir(dir_path)?;
        Ok(())
    }

    fn remove_dir(&self, dir_path: &str, all: bool) -> Result<(), FilestoreError> {
        if !self.exists(dir_path)? {
            return Err(FilestoreError::DirDoesNotExist);
        }
        if !self.is_dir(dir_path)? {
            return Err(FilestoreError::IsNotDirectory);
        }
        if all {
            fs::remove_dir_all(dir_path)?;
        } else {
            fs::remove_dir(dir_path)?;
        }
        Ok(())
    }

    fn list_directory(
        &self,
        dir_path: &str,
        recursive: bool,
    ) -> Result<Vec<String>, FilestoreError> {
        if !self.exists(dir_path)? {
            return Err(FilestoreError::DirDoesNotExist);
        }
        if !self.is_dir(dir_path)? {
            return Err(FilestoreError::IsNotDirectory);
        }
        let mut entries = Vec::new();
        self.list_dir_entries(Path::new(dir_path), recursive, &mut entries)?;
        Ok(entries)
    }

    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError> {
        if buf.len() < read_len as usize {
            return Err(ByteConversionError::ToSliceTooSmall {
                found: buf.len(),
                expected: read_len as usize,
            }
            .into());
        }
        self.check_file(file_path)?;
        let mut file = File::open(file_path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[0..read_len as usize])?;
        Ok(())
    }

    fn write_data(&self, file: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError> {
        self.check_file(file)?;
        let mut file = OpenOptions::new().write(true).open(file)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn is_file(&self, str_path: &str) -> Result<bool, FilestoreError> {
        if !self.exists(str_path)? {
            return Err(FilestoreError::FileDoesNotExist);
        }
        Ok(Path::new(str_path).is_file())
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(self.exists_internal(Path::new(path)))
    }

    fn file_size(&self, str_path: &str) -> Result<u64, FilestoreError> {
        let path = Path::new(str_path);
        if !self.exists_internal(path) {
            return Err(FilestoreError::FileDoesNotExist);
        }
        if !path.is_file() {
            return Err(FilestoreError::IsNotFile);
        }
        Ok(path.metadata()?.len())
    }

    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum: &mut dyn ChecksumComputer,
        size_to_verify: u64,
        verification_buf: &mut [u8],
    ) -> Result<u32, FilestoreError> {
        checksum.reset();
        let mut buf_reader = BufReader::new(File::open(file_path)?);
        let mut current_offset = 0;
        let mut remaining_bytes = size_to_verify;
        while remaining_bytes > 0 {
            let bytes_to_read = remaining_bytes.min(verification_buf.len() as u64) as usize;
            let bytes_read = buf_reader.read(&mut verification_buf[0..bytes_to_read])?;
            if bytes_read == 0 {
                break;
            }
            checksum.update(current_offset, &verification_buf[0..bytes_read]);
            current_offset += bytes_read as u64;
            remaining_bytes -= bytes_read as u64;
        }
        Ok(checksum.value())
    }
}

/// Extract the file name part of a full path, behaving like
/// [std::path::Path::file_name].
pub fn filename_from_full_path(path: &str) -> Option<&str> {
    Path::new(path).file_name().and_then(|name| name.to_str())
}

fn execute_filestore_request(
    filestore: &impl VirtualFilestore,
    request: &FilestoreRequestTlv,
) -> Result<(), FilestoreError> {
    let first = request
        .first_file_name
        .as_str()
        .map_err(|_| FilestoreError::Utf8Error)?;
    let second = request
        .second_file_name
        .as_str()
        .map_err(|_| FilestoreError::Utf8Error)?;
    match request.action_code {
        FilestoreActionCode::CreateFile => filestore.create_file(first),
        FilestoreActionCode::DeleteFile => filestore.remove_file(first),
        FilestoreActionCode::RenameFile => filestore.rename_file(first, second),
        FilestoreActionCode::AppendFile => filestore.append_file(first, second),
        FilestoreActionCode::ReplaceFile => filestore.replace_file(first, second),
        FilestoreActionCode::CreateDirectory => filestore.create_dir(first),
        FilestoreActionCode::RemoveDirectory => filestore.remove_dir(first, false),
        // Deny means delete if present, succeeding even if the target does not exist.
        FilestoreActionCode::DenyFile => match filestore.remove_file(first) {
            Err(FilestoreError::FileDoesNotExist) => Ok(()),
            other => other,
        },
        FilestoreActionCode::DenyDirectory => match filestore.remove_dir(first, true) {
            Err(FilestoreError::DirDoesNotExist) => Ok(()),
            other => other,
        },
    }
}

/// Execute the filestore requests of a Metadata PDU in order and collect the responses
/// for the Finished PDU.
///
/// As specified in CCSDS 727.0-B-5 4.9.4, all requests following a failed one are not
/// performed and reported with the "not performed" status code.
pub fn execute_filestore_requests(
    filestore: &impl VirtualFilestore,
    requests: &[FilestoreRequestTlv],
) -> Vec<FilestoreResponseTlv> {
    let mut responses = Vec::with_capacity(requests.len());
    let mut abandoned = false;
    for request in requests {
        if abandoned {
            responses.push(FilestoreResponseTlv::new_failure(
                request,
                FilestoreResponseTlv::STATUS_NOT_PERFORMED,
                Lv::new_empty(),
            ));
            continue;
        }
        match execute_filestore_request(filestore, request) {
            Ok(()) => responses.push(FilestoreResponseTlv::new_success(request)),
            Err(error) => {
                abandoned = true;
                let message = Lv::new_from_str(&error.to_string()).unwrap_or_default();
                responses.push(FilestoreResponseTlv::new_failure(request, 0b0001, message));
            }
        }
    }
    responses
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{ChecksumType, ModularChecksum};
    use std::path::PathBuf;
    use tempfile::tempdir;

    const EXAMPLE_DATA: [u8; 15] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
    ];

    fn native_filestore() -> (tempfile::TempDir, NativeFilestore) {
        (tempdir().expect("creating tempdir failed"), NativeFilestore::default())
    }

    fn path_str(dir: &tempfile::TempDir, name: &str) -> String {
        let mut path = PathBuf::from(dir.path());
        path.push(name);
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn test_create_file_and_metadata() {
        let (dir, filestore) = native_filestore();
        let file = path_str(&dir, "test.txt");
        filestore.create_file(&file).unwrap();
        assert!(filestore.exists(&file).unwrap());
        assert!(filestore.is_file(&file).unwrap());
        assert_eq!(filestore.file_size(&file).unwrap(), 0);
        assert!(matches!(
            filestore.create_file(&file).unwrap_err(),
            FilestoreError::FileAlreadyExists
        ));
    }

    #[test]
    fn test_write_and_read_back() {
        let (dir, filestore) = native_filestore();
        let file = path_str(&dir, "data.bin");
        filestore.create_file(&file).unwrap();
        filestore.write_data(&file, 0, &EXAMPLE_DATA).unwrap();
        let mut read_buf = [0; 15];
        filestore.read_data(&file, 0, 15, &mut read_buf).unwrap();
        assert_eq!(read_buf, EXAMPLE_DATA);
        // Out of order write at an offset past the current end.
        filestore.write_data(&file, 20, &[0xAB, 0xCD]).unwrap();
        assert_eq!(filestore.file_size(&file).unwrap(), 22);
        let mut tail = [0; 2];
        filestore.read_data(&file, 20, 2, &mut tail).unwrap();
        assert_eq!(tail, [0xAB, 0xCD]);
    }

    #[test]
    fn test_truncate() {
        let (dir, filestore) = native_filestore();
        let file = path_str(&dir, "trunc.bin");
        filestore.create_file(&file).unwrap();
        filestore.write_data(&file, 0, &EXAMPLE_DATA).unwrap();
        filestore.truncate_file(&file).unwrap();
        assert_eq!(filestore.file_size(&file).unwrap(), 0);
    }

    #[test]
    fn test_rename() {
        let (dir, filestore) = native_filestore();
        let old = path_str(&dir, "old.txt");
        let new = path_str(&dir, "new.txt");
        filestore.create_file(&old).unwrap();
        filestore.rename_file(&old, &new).unwrap();
        assert!(!filestore.exists(&old).unwrap());
        assert!(filestore.exists(&new).unwrap());
    }

    #[test]
    fn test_append_and_replace() {
        let (dir, filestore) = native_filestore();
        let first = path_str(&dir, "first.bin");
        let second = path_str(&dir, "second.bin");
        filestore.create_file(&first).unwrap();
        filestore.create_file(&second).unwrap();
        filestore.write_data(&first, 0, &[1, 2]).unwrap();
        filestore.write_data(&second, 0, &[3, 4]).unwrap();
        filestore.append_file(&first, &second).unwrap();
        let mut buf = [0; 4];
        filestore.read_data(&first, 0, 4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        filestore.replace_file(&first, &second).unwrap();
        assert_eq!(filestore.file_size(&first).unwrap(), 2);
    }

    #[test]
    fn test_dir_handling() {
        let (dir, filestore) = native_filestore();
        let sub_dir = path_str(&dir, "subdir");
        filestore.create_dir(&sub_dir).unwrap();
        assert!(filestore.is_dir(&sub_dir).unwrap());
        let nested_file = path_str(&dir, "subdir/file.txt");
        filestore.create_file(&nested_file).unwrap();
        assert!(matches!(
            filestore.remove_dir(&sub_dir, false).unwrap_err(),
            FilestoreError::Io(_)
        ));
        filestore.remove_dir(&sub_dir, true).unwrap();
        assert!(!filestore.exists(&sub_dir).unwrap());
    }

    #[test]
    fn test_list_directory() {
        let (dir, filestore) = native_filestore();
        let sub_dir = path_str(&dir, "subdir");
        let top_file = path_str(&dir, "top.txt");
        let nested_file = path_str(&dir, "subdir/nested.txt");
        filestore.create_dir(&sub_dir).unwrap();
        filestore.create_file(&top_file).unwrap();
        filestore.create_file(&nested_file).unwrap();
        let mut flat = filestore
            .list_directory(dir.path().to_str().unwrap(), false)
            .unwrap();
        flat.sort();
        assert_eq!(flat, vec![sub_dir.clone(), top_file.clone()]);
        let mut recursive = filestore
            .list_directory(dir.path().to_str().unwrap(), true)
            .unwrap();
        recursive.sort();
        assert_eq!(recursive, vec![sub_dir, nested_file, top_file]);
        assert!(matches!(
            filestore
                .list_directory(&path_str(&dir, "missing"), false)
                .unwrap_err(),
            FilestoreError::DirDoesNotExist
        ));
    }

    #[test]
    fn test_checksum_calculation() {
        let (dir, filestore) = native_filestore();
        let file = path_str(&dir, "sum.bin");
        filestore.create_file(&file).unwrap();
        filestore.write_data(&file, 0, &EXAMPLE_DATA).unwrap();
        let mut computer = ModularChecksum::default();
        let mut buf = [0; 4096];
        let checksum = filestore
            .calculate_checksum(&file, &mut computer, 15, &mut buf)
            .unwrap();
        let mut expected = ModularChecksum::default();
        expected.update(0, &EXAMPLE_DATA);
        assert_eq!(checksum, expected.value());
    }

    #[test]
    fn test_checksum_verify_via_registry() {
        let (dir, filestore) = native_filestore();
        let file = path_str(&dir, "verify.bin");
        filestore.create_file(&file).unwrap();
        filestore.write_data(&file, 0, &EXAMPLE_DATA).unwrap();
        let registry = ChecksumRegistry::new_with_defaults();
        let mut expected = ModularChecksum::default();
        expected.update(0, &EXAMPLE_DATA);
        let mut buf = [0; 4096];
        assert!(filestore
            .checksum_verify(
                expected.value(),
                &file,
                ChecksumType::Modular.into(),
                &registry,
                15,
                &mut buf
            )
            .unwrap());
        assert!(!filestore
            .checksum_verify(
                expected.value().wrapping_add(1),
                &file,
                ChecksumType::Modular.into(),
                &registry,
                15,
                &mut buf
            )
            .unwrap());
    }

    #[test]
    fn test_filename_from_full_path() {
        assert_eq!(filename_from_full_path("/tmp/some/file.txt"), Some("file.txt"));
        assert_eq!(filename_from_full_path("file.txt"), Some("file.txt"));
    }

    #[test]
    fn test_filestore_request_execution() {
        let (dir, filestore) = native_filestore();
        let created = path_str(&dir, "created.txt");
        let missing = path_str(&dir, "missing.txt");
        let never = path_str(&dir, "never.txt");
        let requests = [
            FilestoreRequestTlv::new(
                FilestoreActionCode::CreateFile,
                Lv::new_from_str(&created).unwrap(),
                Lv::new_empty(),
            ),
            FilestoreRequestTlv::new(
                FilestoreActionCode::DeleteFile,
                Lv::new_from_str(&missing).unwrap(),
                Lv::new_empty(),
            ),
            FilestoreRequestTlv::new(
                FilestoreActionCode::CreateFile,
                Lv::new_from_str(&never).unwrap(),
                Lv::new_empty(),
            ),
        ];
        let responses = execute_filestore_requests(&filestore, &requests);
        assert_eq!(responses.len(), 3);
        assert!(responses[0].is_success());
        assert_eq!(responses[1].status_code, 0b0001);
        assert_eq!(
            responses[2].status_code,
            FilestoreResponseTlv::STATUS_NOT_PERFORMED
        );
        assert!(filestore.exists(&created).unwrap());
        // The third request was not performed after the second one failed.
        assert!(!filestore.exists(&never).unwrap());
    }

    #[test]
    fn test_deny_file_succeeds_on_missing_target() {
        let (dir, filestore) = native_filestore();
        let missing = path_str(&dir, "missing.txt");
        let requests = [FilestoreRequestTlv::new(
            FilestoreActionCode::DenyFile,
            Lv::new_from_str(&missing).unwrap(),
            Lv::new_empty(),
        )];
        let responses = execute_filestore_requests(&filestore, &requests);
        assert!(responses[0].is_success());
    }
}
