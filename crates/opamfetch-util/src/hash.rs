/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Compute the MD5 digest of a byte slice, returning lowercase hex.
///
/// MD5 is only used to verify upstream opam archives, which publish md5
/// checksums. It is never used for cache identity.
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Incremental MD5 over a streamed body.
pub struct Md5Stream {
    ctx: md5::Context,
    len: u64,
}

impl Md5Stream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.ctx.consume(chunk);
        self.len += chunk.len() as u64;
    }

    /// Number of bytes hashed so far.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish the digest, returning lowercase hex.
    #[must_use]
    pub fn finish_hex(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

impl Default for Md5Stream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_bytes() {
        let hash = blake3_bytes(b"hello world");
        assert_eq!(
            hash,
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_md5_hex() {
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn test_md5_stream_matches_one_shot() {
        let mut stream = Md5Stream::new();
        stream.update(b"hello ");
        stream.update(b"world");
        assert_eq!(stream.len(), 11);
        assert_eq!(stream.finish_hex(), md5_hex(b"hello world"));
    }
}
