//! Command encoder.

use crate::CRLF;
use bytes::{BufMut, BytesMut};

/// Encodes commands as RESP arrays of blob strings.
pub struct Encoder;

impl Encoder {
    /// Encodes a command into a fresh buffer.
    pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(Self::encoded_len(args));
        Self::encode_into(&mut buf, args);
        buf
    }

    /// Appends an encoded command to `buf`.
    pub fn encode_into<A: AsRef<[u8]>>(buf: &mut BytesMut, args: &[A]) {
        buf.reserve(Self::encoded_len(args));
        Self::put_header(buf, b'*', args.len());
        for arg in args {
            let arg = arg.as_ref();
            Self::put_header(buf, b'$', arg.len());
            buf.put_slice(arg);
            buf.put_slice(CRLF);
        }
    }

    /// Exact number of bytes [`Encoder::encode_into`] writes for `args`.
    pub fn encoded_len<A: AsRef<[u8]>>(args: &[A]) -> usize {
        let header = |n: usize| 1 + decimal_len(n) + 2;
        args.iter()
            .map(|arg| {
                let len = arg.as_ref().len();
                header(len) + len + 2
            })
            .sum::<usize>()
            + header(args.len())
    }

    fn put_header(buf: &mut BytesMut, tag: u8, len: usize) {
        buf.put_u8(tag);
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(CRLF);
    }
}

fn decimal_len(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
