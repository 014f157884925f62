use anyhow::bail;


/// Bounds-checked skipping, complementing the `try_get_*` getters of [bytes::Buf]. Every
///  Baichuan header has reserved fields, and a short datagram must surface as an error rather
///  than a panic.
pub trait BufExt: bytes::Buf {
    fn skip_checked(&mut self, len: usize) -> anyhow::Result<()> {
        if self.remaining() < len {
            bail!("buffer underflow skipping {} bytes, {} remaining", len, self.remaining());
        }
        self.advance(len);
        Ok(())
    }
}

impl <T: bytes::Buf> BufExt for T {}
