use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::cmp::{min, Ordering};
use std::collections::BTreeSet;
use tracing::{trace, warn};

/// A contiguous byte range of a stream, as delivered by the decode layer.
#[derive(Clone, Debug)]
pub struct StreamElement {
    offset: u64,
    data: Bytes,
    fin: bool,
}

impl StreamElement {
    pub fn new(offset: u64, data: impl Into<Bytes>, fin: bool) -> StreamElement {
        StreamElement { offset, data: data.into(), fin }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// first offset after this element
    pub fn upto(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_final(&self) -> bool {
        self.fin
    }
}

/// Elements are identified by their stream range: two elements covering the same
///  `[offset, upto)` range carry the same bytes and are interchangeable, so the
///  reassembly set deduplicates on range alone.
impl PartialEq for StreamElement {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.upto() == other.upto()
    }
}

impl Eq for StreamElement {}

impl PartialOrd for StreamElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StreamElement {
    fn cmp(&self, other: &Self) -> Ordering {
        // offset ascending; on equal offsets the longer element sorts later, so
        //  the read walk picks its extra bytes up after the shorter one
        self.offset.cmp(&other.offset)
            .then(self.upto().cmp(&other.upto()))
    }
}

/// Buffers arbitrarily overlapping, out-of-order byte ranges of one stream and
///  hands out the gap-free prefix.
///
/// Elements stay buffered until a read consumes them completely; reads advance
///  `processed_to`, the offset below which everything has been delivered to the
///  application. Overlaps are resolved at read time by walking elements in range
///  order and copying only the bytes beyond the read cursor.
pub struct ReassemblyBuffer {
    elements: BTreeSet<StreamElement>,
    processed_to: u64,
    buffered_bytes: usize,
    final_size: Option<u64>,
    max_buffered: usize,
}

impl ReassemblyBuffer {
    pub fn new(max_buffered: usize) -> ReassemblyBuffer {
        ReassemblyBuffer {
            elements: BTreeSet::new(),
            processed_to: 0,
            buffered_bytes: 0,
            final_size: None,
            max_buffered,
        }
    }

    /// Add a received byte range. Returns false if the range is already fully
    ///  delivered (a late duplicate). An element that would push the buffered
    ///  volume above the configured ceiling is rejected as backpressure - the
    ///  caller decides whether to stall the peer or kill the connection.
    pub fn add(&mut self, element: StreamElement) -> anyhow::Result<bool> {
        if element.is_final() {
            match self.final_size {
                None => self.final_size = Some(element.upto()),
                Some(final_size) if final_size != element.upto() => {
                    warn!("peer moved the final size from {} to {} - keeping the first", final_size, element.upto());
                }
                Some(_) => {}
            }
        }

        if element.upto() <= self.processed_to {
            trace!("element [{}, {}) is already delivered - dropping", element.offset(), element.upto());
            return Ok(false);
        }

        if self.buffered_bytes + element.len() > self.max_buffered {
            bail!(
                "reassembly buffer full: {} bytes buffered, element of {} exceeds limit of {}",
                self.buffered_bytes, element.len(), self.max_buffered
            );
        }

        let len = element.len();
        if self.elements.insert(element) {
            self.buffered_bytes += len;
        }
        Ok(true)
    }

    /// Number of bytes a read would currently return: the length of the
    ///  contiguous run from `processed_to` to the first gap.
    pub fn bytes_available(&self) -> usize {
        let mut cursor = self.processed_to;
        for element in &self.elements {
            if element.offset() > cursor {
                break;
            }
            if element.upto() > cursor {
                cursor = element.upto();
            }
        }
        (cursor - self.processed_to) as usize
    }

    /// Copy as much of the contiguous prefix as fits into `dest`, advancing the
    ///  read position and discarding elements that are fully consumed. Reading
    ///  the remainder with a second call yields the same bytes one larger buffer
    ///  would have.
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let mut cursor = self.processed_to;
        let mut written = 0;

        for element in &self.elements {
            if written == dest.len() || element.offset() > cursor {
                break;
            }
            if element.upto() > cursor {
                let skip = (cursor - element.offset()) as usize;
                let count = min(dest.len() - written, (element.upto() - cursor) as usize);
                dest[written..written + count].copy_from_slice(&element.data()[skip..skip + count]);
                cursor += count as u64;
                written += count;
            }
        }

        self.processed_to = cursor;

        while let Some(first) = self.elements.first() {
            if first.upto() > self.processed_to {
                break;
            }
            self.buffered_bytes -= first.len();
            self.elements.pop_first();
        }

        written
    }

    /// the position up to which stream bytes have been read
    pub fn read_offset(&self) -> u64 {
        self.processed_to
    }

    /// the stream's total length, once an element with the final flag arrived
    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    /// true once every byte up to the final size has been read
    pub fn is_finished(&self) -> bool {
        self.final_size == Some(self.processed_to)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }
}

/// Reassembly state for all streams of a connection, created lazily per stream.
///
/// NB: not internally synchronized - the receive path and the reading
///      application share one lock around it.
pub struct StreamReassembly {
    max_buffered_per_stream: usize,
    streams: FxHashMap<u64, ReassemblyBuffer>,
}

impl StreamReassembly {
    pub fn new(max_buffered_per_stream: usize) -> StreamReassembly {
        StreamReassembly {
            max_buffered_per_stream,
            streams: FxHashMap::default(),
        }
    }

    pub fn stream_mut(&mut self, stream_id: u64) -> &mut ReassemblyBuffer {
        self.streams
            .entry(stream_id)
            .or_insert_with(|| ReassemblyBuffer::new(self.max_buffered_per_stream))
    }

    pub fn add(&mut self, stream_id: u64, element: StreamElement) -> anyhow::Result<bool> {
        self.stream_mut(stream_id).add(element)
    }

    pub fn bytes_available(&self, stream_id: u64) -> usize {
        self.streams.get(&stream_id).map_or(0, ReassemblyBuffer::bytes_available)
    }

    pub fn read(&mut self, stream_id: u64, dest: &mut [u8]) -> usize {
        self.streams.get_mut(&stream_id).map_or(0, |stream| stream.read(dest))
    }

    pub fn read_offset(&self, stream_id: u64) -> u64 {
        self.streams.get(&stream_id).map_or(0, ReassemblyBuffer::read_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn element(offset: u64, data: &[u8]) -> StreamElement {
        StreamElement::new(offset, Bytes::copy_from_slice(data), false)
    }

    fn final_element(offset: u64, data: &[u8]) -> StreamElement {
        StreamElement::new(offset, Bytes::copy_from_slice(data), true)
    }

    fn buffer() -> ReassemblyBuffer {
        ReassemblyBuffer::new(1024)
    }

    #[test]
    fn test_out_of_order_overlap() {
        let mut buffer = buffer();
        buffer.add(element(10, b"FGHIJ")).unwrap();
        assert_eq!(buffer.bytes_available(), 0);

        buffer.add(element(0, b"ABCDEFGHIJ")).unwrap();
        assert_eq!(buffer.bytes_available(), 15);

        let mut dest = [0u8; 20];
        let read = buffer.read(&mut dest);
        assert_eq!(read, 15);
        assert_eq!(&dest[..15], b"ABCDEFGHIJFGHIJ");
        assert_eq!(buffer.read_offset(), 15);
        assert_eq!(buffer.buffered_bytes(), 0);
    }

    #[test]
    fn test_in_order_delivery() {
        let mut buffer = buffer();
        buffer.add(element(0, b"hello ")).unwrap();
        buffer.add(element(6, b"world")).unwrap();

        let mut dest = [0u8; 32];
        let read = buffer.read(&mut dest);
        assert_eq!(&dest[..read], b"hello world");
    }

    #[test]
    fn test_gap_stops_the_walk() {
        let mut buffer = buffer();
        buffer.add(element(0, b"abc")).unwrap();
        buffer.add(element(5, b"fgh")).unwrap();

        assert_eq!(buffer.bytes_available(), 3);
        let mut dest = [0u8; 32];
        assert_eq!(buffer.read(&mut dest), 3);
        assert_eq!(&dest[..3], b"abc");

        // the gap is filled, the walk continues through the buffered tail
        buffer.add(element(3, b"de")).unwrap();
        assert_eq!(buffer.bytes_available(), 5);
        let read = buffer.read(&mut dest);
        assert_eq!(&dest[..read], b"defgh");
        assert_eq!(buffer.read_offset(), 8);
    }

    #[test]
    fn test_duplicate_element_is_deduplicated() {
        let mut buffer = buffer();
        assert!(buffer.add(element(0, b"abc")).unwrap());
        assert!(buffer.add(element(0, b"abc")).unwrap());
        assert_eq!(buffer.buffered_bytes(), 3);

        let mut dest = [0u8; 32];
        assert_eq!(buffer.read(&mut dest), 3);
    }

    #[test]
    fn test_late_duplicate_is_rejected() {
        let mut buffer = buffer();
        buffer.add(element(0, b"abc")).unwrap();
        let mut dest = [0u8; 32];
        buffer.read(&mut dest);

        assert!(!buffer.add(element(0, b"abc")).unwrap());
        assert_eq!(buffer.buffered_bytes(), 0);
    }

    #[test]
    fn test_fully_contained_element_contributes_nothing() {
        let mut buffer = buffer();
        buffer.add(element(0, b"ABCDEFGHIJ")).unwrap();
        buffer.add(element(3, b"DEF")).unwrap();

        assert_eq!(buffer.bytes_available(), 10);
        let mut dest = [0u8; 32];
        let read = buffer.read(&mut dest);
        assert_eq!(&dest[..read], b"ABCDEFGHIJ");
    }

    #[test]
    fn test_same_offset_longer_element_wins() {
        let mut buffer = buffer();
        buffer.add(element(0, b"AB")).unwrap();
        buffer.add(element(0, b"ABCDE")).unwrap();

        assert_eq!(buffer.bytes_available(), 5);
        let mut dest = [0u8; 32];
        let read = buffer.read(&mut dest);
        assert_eq!(&dest[..read], b"ABCDE");
    }

    #[rstest]
    #[case::split_mid_element(7)]
    #[case::split_at_element_boundary(10)]
    #[case::split_tiny(1)]
    fn test_partitioned_reads_equal_one_large_read(#[case] first_read_size: usize) {
        let mut buffer = buffer();
        buffer.add(element(10, b"FGHIJ")).unwrap();
        buffer.add(element(0, b"ABCDEFGHIJ")).unwrap();

        let mut first = vec![0u8; first_read_size];
        let n1 = buffer.read(&mut first);
        assert_eq!(n1, first_read_size);

        let mut second = [0u8; 32];
        let n2 = buffer.read(&mut second);
        assert_eq!(n1 + n2, 15);

        let mut combined = first[..n1].to_vec();
        combined.extend_from_slice(&second[..n2]);
        assert_eq!(combined, b"ABCDEFGHIJFGHIJ");
    }

    #[test]
    fn test_final_element_fixes_stream_length() {
        let mut buffer = buffer();
        buffer.add(element(0, b"ABCDE")).unwrap();
        buffer.add(final_element(5, b"FGH")).unwrap();

        assert_eq!(buffer.final_size(), Some(8));
        assert!(!buffer.is_finished());

        let mut dest = [0u8; 32];
        assert_eq!(buffer.read(&mut dest), 8);
        assert!(buffer.is_finished());
    }

    #[test]
    fn test_conflicting_final_size_keeps_first() {
        let mut buffer = buffer();
        buffer.add(final_element(0, b"ABC")).unwrap();
        buffer.add(final_element(0, b"ABCDE")).unwrap();

        assert_eq!(buffer.final_size(), Some(3));
    }

    #[test]
    fn test_overflow_reports_backpressure() {
        let mut buffer = ReassemblyBuffer::new(8);
        buffer.add(element(0, b"ABCDE")).unwrap();

        assert!(buffer.add(element(10, b"FGHIJ")).is_err());
        // rejected element must not count towards the buffered volume
        assert_eq!(buffer.buffered_bytes(), 5);

        // draining the buffer makes room again
        let mut dest = [0u8; 8];
        buffer.read(&mut dest);
        assert!(buffer.add(element(10, b"FGHIJ")).is_ok());
    }

    #[test]
    fn test_registry_creates_streams_lazily() {
        let mut reassembly = StreamReassembly::new(1024);

        assert_eq!(reassembly.bytes_available(4), 0);
        assert_eq!(reassembly.read_offset(4), 0);

        reassembly.add(4, element(0, b"abc")).unwrap();
        reassembly.add(8, element(0, b"xy")).unwrap();

        assert_eq!(reassembly.bytes_available(4), 3);
        assert_eq!(reassembly.bytes_available(8), 2);

        let mut dest = [0u8; 8];
        assert_eq!(reassembly.read(4, &mut dest), 3);
        assert_eq!(&dest[..3], b"abc");
        assert_eq!(reassembly.read_offset(4), 3);
        assert_eq!(reassembly.read_offset(8), 0);
    }
}
