use std::fmt;
use std::io;

/// Wraps an [io::Write] for use as a [fmt::Write].
pub struct ToWriteFmt<T: io::Write>(pub T);

impl<T: io::Write> fmt::Write for ToWriteFmt<T> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn test_to_write_fmt_forwards_bytes() {
        let mut w = ToWriteFmt(Vec::new());
        writeln!(w, "Time (cycles): {}", 3).unwrap();
        assert_eq!(w.0, b"Time (cycles): 3\n");
    }
}
