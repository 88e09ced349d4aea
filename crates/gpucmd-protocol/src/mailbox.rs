use core::fmt;

pub const MAILBOX_SIZE_BYTES: usize = 16;
pub const MAILBOX_SIZE_WORDS: usize = MAILBOX_SIZE_BYTES / 4;

/// Opaque 128-bit name used to hand a texture from one context to another.
///
/// The bytes carry no structure; equality and hashing are all the service relies on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Mailbox([u8; MAILBOX_SIZE_BYTES]);

impl Mailbox {
    pub const fn from_bytes(bytes: [u8; MAILBOX_SIZE_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn from_words(words: &[u32; MAILBOX_SIZE_WORDS]) -> Self {
        let mut bytes = [0u8; MAILBOX_SIZE_BYTES];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        Self(bytes)
    }

    pub fn to_words(&self) -> [u32; MAILBOX_SIZE_WORDS] {
        let mut words = [0u32; MAILBOX_SIZE_WORDS];
        for (word, chunk) in words.iter_mut().zip(self.0.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        words
    }

    pub const fn as_bytes(&self) -> &[u8; MAILBOX_SIZE_BYTES] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Mailbox(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_preserve_byte_order() {
        let mut bytes = [0u8; MAILBOX_SIZE_BYTES];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mailbox = Mailbox::from_bytes(bytes);
        let words = mailbox.to_words();
        assert_eq!(words[0], 0x0302_0100);
        assert_eq!(Mailbox::from_words(&words), mailbox);
        assert!(!mailbox.is_zero());
        assert!(Mailbox::default().is_zero());
    }
}
