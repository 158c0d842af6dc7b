macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return std::result::Result::Err($err.into());
        }
    };
}

macro_rules! bail {
    ($err:expr $(,)?) => {{
        return std::result::Result::Err($err.into());
    }};
}

/// A wrapper around `&[u8]` that implements [`std::fmt::Display`] in a more
/// intelligent way, for logging message bodies.
pub struct DisplayBytes<'a>(pub &'a [u8]);

impl std::fmt::Display for DisplayBytes<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.0) {
            Ok(string) if string.len() <= 20 => {
                f.write_fmt(format_args!("\"{}\"", string.replace('"', "\\\"")))
            },
            Ok(string) => {
                f.write_fmt(format_args!("\"{:.15}…\"", string.replace('"', "\\\"")))
            },
            Err(_) => f.write_fmt(format_args!("<{} bytes>", self.0.len())),
        }
    }
}
