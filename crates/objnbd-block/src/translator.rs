//! Object translation for block I/O
//!
//! Maps client byte ranges onto the fixed-size objects of a volume.

/// Object index within a volume
pub type ObjectIndex = u64;

/// One object-granular piece of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubOpSpec {
    /// Position within the parent request (0 = first)
    pub sequence: u32,
    /// Object this piece touches
    pub object_index: ObjectIndex,
    /// Byte offset within the object
    pub offset_in_object: u64,
    /// Byte offset within the client request (payload position)
    pub request_offset: u64,
    /// Number of bytes in this piece
    pub length: u64,
    /// True unless the piece covers the whole object
    pub partial: bool,
}

/// Maps byte ranges to objects
///
/// Volumes are divided into fixed-size objects. Only the first and last
/// piece of a range can be partial; every interior piece is a whole object.
///
/// ```text
/// offset=100, length=8192, object_size=4096
/// ├── seq 0: object 0  bytes 100..4096   partial
/// ├── seq 1: object 1  bytes 0..4096     full
/// └── seq 2: object 2  bytes 0..100      partial
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ObjectMapper {
    object_size: u64,
}

impl ObjectMapper {
    /// Create a new mapper for the given object size
    pub fn new(object_size: u64) -> Self {
        assert!(object_size > 0, "Object size must be positive");
        Self { object_size }
    }

    /// Get the object size
    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    /// Convert a byte offset to an object index
    pub fn object_index(&self, byte_offset: u64) -> ObjectIndex {
        byte_offset / self.object_size
    }

    /// Offset of `byte_offset` within its object
    pub fn skew(&self, byte_offset: u64) -> u64 {
        byte_offset % self.object_size
    }

    /// Volume byte offset where an object starts
    pub fn object_offset(&self, index: ObjectIndex) -> u64 {
        index * self.object_size
    }

    /// Number of objects touched by `[offset, offset + length)`
    pub fn objects_touched(&self, offset: u64, length: u64) -> u64 {
        if length == 0 {
            return 0;
        }
        (self.skew(offset) + length).div_ceil(self.object_size)
    }

    /// Number of objects needed for a volume of the given size
    pub fn objects_for_size(&self, size_bytes: u64) -> u64 {
        size_bytes.div_ceil(self.object_size)
    }

    /// Split `[offset, offset + length)` into per-object pieces.
    ///
    /// The caller guarantees `offset + length` does not overflow.
    pub fn decompose(&self, offset: u64, length: u64) -> Vec<SubOpSpec> {
        let count = self.objects_touched(offset, length);
        let first_index = self.object_index(offset);
        let end = offset + length;

        let mut specs = Vec::with_capacity(count as usize);
        let mut cursor = offset;

        for (sequence, object_index) in (first_index..first_index + count).enumerate() {
            let object_start = self.object_offset(object_index);
            let object_end = object_start + self.object_size;
            let piece_end = end.min(object_end);
            let piece_len = piece_end - cursor;

            specs.push(SubOpSpec {
                sequence: sequence as u32,
                object_index,
                offset_in_object: cursor - object_start,
                request_offset: cursor - offset,
                length: piece_len,
                partial: piece_len < self.object_size,
            });
            cursor = piece_end;
        }

        specs
    }
}

/// Split a byte range into per-object sub-operation specs.
pub fn decompose(offset: u64, length: u64, object_size: u64) -> Vec<SubOpSpec> {
    ObjectMapper::new(object_size).decompose(offset, length)
}
