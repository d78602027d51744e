//! File segmentation for outgoing file data PDUs.
use crate::filestore::{FilestoreError, VirtualFilestore};

/// A file segment with its file offset, ready to be wrapped into a file data PDU.
///
/// The terminal segment of the initial transmission pass carries no data, has its
/// offset set to the file size and [Self::is_eof] set. It signals that the file is
/// exhausted and the EOF PDU is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSegment {
    pub offset: u64,
    pub data: Vec<u8>,
    pub is_eof: bool,
}

/// Splits a file into segments of at most the configured length.
///
/// [Self::next_segment] yields the segments in order with strictly increasing offsets
/// for the initial transmission pass. Retransmission reads for arbitrary offset ranges
/// go through [Self::chunks_in_range] and [Self::read_segment] and do not disturb the
/// transmission progress.
#[derive(Debug)]
pub struct FileSegmenter {
    file_path: String,
    file_size: u64,
    segment_len: usize,
    progress: u64,
    eof_marker_emitted: bool,
}

impl FileSegmenter {
    pub fn new(file_path: &str, file_size: u64, segment_len: usize) -> Self {
        assert!(segment_len > 0, "segment length must not be 0");
        Self {
            file_path: file_path.to_string(),
            file_size,
            segment_len,
            progress: 0,
            eof_marker_emitted: false,
        }
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[inline]
    pub fn progress(&self) -> u64 {
        self.progress
    }

    /// Whether the initial transmission pass handed out its terminal marker segment.
    #[inline]
    pub fn done(&self) -> bool {
        self.eof_marker_emitted
    }

    /// Next segment of the initial transmission pass. Once the file is exhausted, a
    /// single terminal marker segment with the offset set to the file size and no data
    /// follows the data segments, then [None]. Empty files yield only the marker.
    pub fn next_segment(
        &mut self,
        filestore: &impl VirtualFilestore,
    ) -> Result<Option<FileSegment>, FilestoreError> {
        if self.progress >= self.file_size {
            if self.eof_marker_emitted {
                return Ok(None);
            }
            self.eof_marker_emitted = true;
            return Ok(Some(FileSegment {
                offset: self.file_size,
                data: Vec::new(),
                is_eof: true,
            }));
        }
        let read_len = self
            .segment_len
            .min((self.file_size - self.progress) as usize);
        let segment = self.read_segment(filestore, self.progress, self.progress + read_len as u64)?;
        self.progress += read_len as u64;
        Ok(Some(segment))
    }

    /// Read one segment for the given offset range, clamped to the file size.
    pub fn read_segment(
        &self,
        filestore: &impl VirtualFilestore,
        start: u64,
        end: u64,
    ) -> Result<FileSegment, FilestoreError> {
        let end = end.min(self.file_size);
        let read_len = end.saturating_sub(start);
        let mut data = vec![0; read_len as usize];
        filestore.read_data(&self.file_path, start, read_len, &mut data)?;
        Ok(FileSegment {
            offset: start,
            data,
            is_eof: false,
        })
    }

    /// Chunk boundaries covering the given range, each at most one segment long. Used
    /// to split a requested retransmission range into file data PDU sized pieces.
    pub fn chunks_in_range(
        &self,
        start: u64,
        end: u64,
    ) -> impl Iterator<Item = (u64, u64)> + '_ {
        let end = end.min(self.file_size);
        let segment_len = self.segment_len as u64;
        (0..)
            .map(move |idx| start + idx * segment_len)
            .take_while(move |chunk_start| *chunk_start < end)
            .map(move |chunk_start| (chunk_start, (chunk_start + segment_len).min(end)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filestore::NativeFilestore;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn filestore_with_file(data: &[u8]) -> (tempfile::TempDir, NativeFilestore, String) {
        let dir = tempdir().expect("creating tempdir failed");
        let filestore = NativeFilestore::default();
        let mut path = PathBuf::from(dir.path());
        path.push("src.bin");
        let path = path.to_str().unwrap().to_string();
        filestore.create_file(&path).unwrap();
        filestore.write_data(&path, 0, data).unwrap();
        (dir, filestore, path)
    }

    #[test]
    fn test_sequential_segments() {
        let data: Vec<u8> = (0..10).collect();
        let (_dir, filestore, path) = filestore_with_file(&data);
        let mut segmenter = FileSegmenter::new(&path, 10, 4);
        let first = segmenter.next_segment(&filestore).unwrap().unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(first.data, [0, 1, 2, 3]);
        let second = segmenter.next_segment(&filestore).unwrap().unwrap();
        assert_eq!(second.offset, 4);
        assert_eq!(second.data, [4, 5, 6, 7]);
        let third = segmenter.next_segment(&filestore).unwrap().unwrap();
        assert_eq!(third.offset, 8);
        assert_eq!(third.data, [8, 9]);
        assert!(!third.is_eof);
        assert!(!segmenter.done());
        let marker = segmenter.next_segment(&filestore).unwrap().unwrap();
        assert_eq!(marker.offset, 10);
        assert!(marker.data.is_empty());
        assert!(marker.is_eof);
        assert!(segmenter.done());
        assert!(segmenter.next_segment(&filestore).unwrap().is_none());
    }

    #[test]
    fn test_empty_file_yields_only_marker() {
        let (_dir, filestore, path) = filestore_with_file(&[]);
        let mut segmenter = FileSegmenter::new(&path, 0, 64);
        assert!(!segmenter.done());
        let marker = segmenter.next_segment(&filestore).unwrap().unwrap();
        assert_eq!(marker.offset, 0);
        assert!(marker.data.is_empty());
        assert!(marker.is_eof);
        assert!(segmenter.done());
        assert!(segmenter.next_segment(&filestore).unwrap().is_none());
    }

    #[test]
    fn test_retransmission_read() {
        let data: Vec<u8> = (0..20).collect();
        let (_dir, filestore, path) = filestore_with_file(&data);
        let segmenter = FileSegmenter::new(&path, 20, 8);
        let segment = segmenter.read_segment(&filestore, 5, 9).unwrap();
        assert_eq!(segment.offset, 5);
        assert_eq!(segment.data, [5, 6, 7, 8]);
        // End clamped to the file size.
        let segment = segmenter.read_segment(&filestore, 16, 100).unwrap();
        assert_eq!(segment.data, [16, 17, 18, 19]);
    }

    #[test]
    fn test_chunks_in_range() {
        let segmenter = FileSegmenter::new("unused", 100, 30);
        let chunks: Vec<_> = segmenter.chunks_in_range(10, 95).collect();
        assert_eq!(chunks, [(10, 40), (40, 70), (70, 95)]);
        let chunks: Vec<_> = segmenter.chunks_in_range(90, 200).collect();
        assert_eq!(chunks, [(90, 100)]);
    }
}
