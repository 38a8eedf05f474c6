use std::io;

use crate::errors::{Error, ErrorKind, RespResult};

/// A single request: an ordered vector of opaque binary arguments.
///
/// Arguments are stored back to back in one buffer; packing produces the
/// wire form, an array header followed by one length-prefixed bulk string
/// per argument. Translation between caller types and argument bytes is a
/// collaborator concern, the command itself never inspects its arguments.
#[derive(Clone, Default)]
pub struct Cmd {
    data: Vec<u8>,
    // end offset of each argument within `data`
    args: Vec<usize>,
}

/// Shortcut for creating a command with the given name.
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

fn countdigits(mut v: usize) -> usize {
    let mut result = 1;
    loop {
        if v < 10 {
            return result;
        }
        if v < 100 {
            return result + 1;
        }
        if v < 1000 {
            return result + 2;
        }
        if v < 10000 {
            return result + 3;
        }

        v /= 10000;
        result += 4;
    }
}

#[inline]
fn bulklen(len: usize) -> usize {
    1 + countdigits(len) + 2 + len + 2
}

impl Cmd {
    /// Creates a new empty command.
    pub fn new() -> Cmd {
        Cmd::default()
    }

    /// Appends an argument. Arguments are opaque bytes; no encoding is
    /// assumed beyond what the caller already applied.
    pub fn arg(&mut self, arg: impl AsRef<[u8]>) -> &mut Cmd {
        self.data.extend_from_slice(arg.as_ref());
        self.args.push(self.data.len());
        self
    }

    /// The number of arguments, including the command name.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Iterates over the raw argument slices in order.
    pub fn args_iter(&self) -> impl ExactSizeIterator<Item = &[u8]> + Clone {
        self.args.iter().enumerate().map(move |(idx, &end)| {
            let start = if idx == 0 { 0 } else { self.args[idx - 1] };
            &self.data[start..end]
        })
    }

    /// Produces the wire bytes for this command.
    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.packed_len());
        // writing to a Vec cannot fail
        write_command(&mut out, self.args_iter()).unwrap();
        out
    }

    /// Produces the wire bytes, rejecting arguments above `ceiling` bytes
    /// with an [`ErrorKind::Encoding`] error before anything is written.
    pub fn pack(&self, ceiling: Option<usize>) -> RespResult<Vec<u8>> {
        if let Some(ceiling) = ceiling {
            if let Some(oversized) = self.args_iter().map(<[u8]>::len).find(|len| *len > ceiling) {
                return Err(Error::from((
                    ErrorKind::Encoding,
                    "argument exceeds the configured size ceiling",
                    format!("{oversized} > {ceiling} bytes"),
                )));
            }
        }
        Ok(self.get_packed_command())
    }

    fn packed_len(&self) -> usize {
        let mut total = 1 + countdigits(self.args.len()) + 2;
        for arg in self.args_iter() {
            total += bulklen(arg.len());
        }
        total
    }
}

fn write_command<'a, I>(out: &mut (impl ?Sized + io::Write), args: I) -> io::Result<()>
where
    I: IntoIterator<Item = &'a [u8]> + ExactSizeIterator,
{
    let mut buf = itoa::Buffer::new();

    out.write_all(b"*")?;
    out.write_all(buf.format(args.len()).as_bytes())?;
    out.write_all(b"\r\n")?;

    for arg in args {
        out.write_all(b"$")?;
        out.write_all(buf.format(arg.len()).as_bytes())?;
        out.write_all(b"\r\n")?;
        out.write_all(arg)?;
        out.write_all(b"\r\n")?;
    }
    Ok(())
}
