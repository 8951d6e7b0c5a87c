use crate::{Error, ErrorKind, Result};

/// Role of a [`SecurityBuffer`] in a message protection call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferType {
    /// Holds the MIC token or the Wrap token header and trailer.
    Token,
    /// Holds the application data. It is encrypted and decrypted in place.
    Data,
    /// Padding for block ciphers. Left empty by the AES encryption types.
    Padding,
}

/// A buffer passed to the `sign`, `verify`, `encrypt` and `decrypt` operations.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityBuffer {
    pub buffer: Vec<u8>,
    pub buffer_type: BufferType,
}

impl SecurityBuffer {
    pub fn new(buffer: Vec<u8>, buffer_type: BufferType) -> Self {
        Self { buffer, buffer_type }
    }

    pub fn token_buf(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferType::Token)
    }

    pub fn data_buf(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferType::Data)
    }

    pub fn padding_buf(buffer: Vec<u8>) -> Self {
        Self::new(buffer, BufferType::Padding)
    }

    /// Returns the first buffer with the specified buffer type.
    pub fn find_buffer(buffers: &[SecurityBuffer], buffer_type: BufferType) -> Result<&SecurityBuffer> {
        buffers.iter().find(|b| b.buffer_type == buffer_type).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidParameter,
                format!("no buffer was provided with type {:?}", buffer_type),
            )
        })
    }

    /// Returns the first buffer with the specified buffer type.
    pub fn find_buffer_mut(buffers: &mut [SecurityBuffer], buffer_type: BufferType) -> Result<&mut SecurityBuffer> {
        buffers.iter_mut().find(|b| b.buffer_type == buffer_type).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidParameter,
                format!("no buffer was provided with type {:?}", buffer_type),
            )
        })
    }

    pub fn buffers_of_type(buffers: &[SecurityBuffer], buffer_type: BufferType) -> impl Iterator<Item = &SecurityBuffer> {
        buffers.iter().filter(move |b| b.buffer_type == buffer_type)
    }

    pub fn buffers_of_type_mut(
        buffers: &mut [SecurityBuffer],
        buffer_type: BufferType,
    ) -> impl Iterator<Item = &mut SecurityBuffer> {
        buffers.iter_mut().filter(move |b| b.buffer_type == buffer_type)
    }

    /// Concatenates the content of all `Data` buffers in their order.
    pub fn collect_data(buffers: &[SecurityBuffer]) -> Vec<u8> {
        Self::buffers_of_type(buffers, BufferType::Data).fold(Vec::new(), |mut acc, buffer| {
            acc.extend_from_slice(&buffer.buffer);
            acc
        })
    }

    /// Writes `data` back into the `Data` buffers, keeping each buffer's length.
    ///
    /// A single `Data` buffer takes all of `data` regardless of its previous length.
    pub fn scatter_data(buffers: &mut [SecurityBuffer], data: &[u8]) -> Result<()> {
        let data_buffers_count = Self::buffers_of_type(buffers, BufferType::Data).count();

        if data_buffers_count == 1 {
            let buffer = Self::find_buffer_mut(buffers, BufferType::Data)?;
            buffer.buffer = data.to_vec();

            return Ok(());
        }

        let expected_len: usize = Self::buffers_of_type(buffers, BufferType::Data)
            .map(|b| b.buffer.len())
            .sum();
        if expected_len != data.len() {
            return Err(Error::new(
                ErrorKind::FormatError,
                format!(
                    "data buffers can hold {} bytes but {} bytes were produced",
                    expected_len,
                    data.len()
                ),
            ));
        }

        let mut rest = data;
        for buffer in Self::buffers_of_type_mut(buffers, BufferType::Data) {
            let (chunk, tail) = rest.split_at(buffer.buffer.len());
            buffer.buffer.copy_from_slice(chunk);
            rest = tail;
        }

        Ok(())
    }
}

impl std::fmt::Debug for SecurityBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurityBuffer {{ buffer_type: {:?}, buffer: 0x", self.buffer_type)?;
        self.buffer.iter().try_for_each(|byte| write!(f, "{byte:02X}"))?;
        write!(f, " }}")
    }
}
