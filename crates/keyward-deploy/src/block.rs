//! Managed block parsing and splicing
//!
//! ```text
//! # keyward:begin serial=<N>
//! ...
//! # keyward:end
//! ```
//!
//! Everything outside the block is opaque and kept byte-for-byte. A header
//! without a footer owns the rest of the file.

/// First line of the managed block, followed by ` serial=<N>`
pub const HEADER_PREFIX: &str = "# keyward:begin";
/// Last line of the managed block
pub const FOOTER: &str = "# keyward:end";

/// Header line naming the producing system-key serial
#[must_use]
pub fn header_line(serial: u64) -> String {
    format!("{HEADER_PREFIX} serial={serial}")
}

/// Parse a header line; the inner `None` is a header with no readable serial
#[must_use]
pub fn parse_header(line: &str) -> Option<Option<u64>> {
    let rest = line.trim_end().strip_prefix(HEADER_PREFIX)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(
        rest.split_whitespace()
            .find_map(|token| token.strip_prefix("serial="))
            .and_then(|serial| serial.parse().ok()),
    )
}

/// The managed region found in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedBlock<'a> {
    /// Serial from the header
    pub serial: Option<u64>,
    /// Header through footer, inclusive
    pub text: &'a str,
    /// Whether a footer closed the block
    pub terminated: bool,
}

/// A file split around its managed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitContent<'a> {
    pub prefix: &'a str,
    pub block: Option<ManagedBlock<'a>>,
    pub suffix: &'a str,
}

/// Locate the first managed block
#[must_use]
pub fn split_managed(content: &str) -> SplitContent<'_> {
    let mut offset = 0;
    let mut header: Option<(usize, Option<u64>)> = None;

    for line in content.split_inclusive('\n') {
        let end = offset + line.len();
        match header {
            None => {
                if let Some(serial) = parse_header(line) {
                    header = Some((offset, serial));
                }
            }
            Some((start, serial)) if line.trim_end() == FOOTER => {
                return SplitContent {
                    prefix: &content[..start],
                    block: Some(ManagedBlock {
                        serial,
                        text: &content[start..end],
                        terminated: true,
                    }),
                    suffix: &content[end..],
                };
            }
            Some(_) => {}
        }
        offset = end;
    }

    match header {
        Some((start, serial)) => SplitContent {
            prefix: &content[..start],
            block: Some(ManagedBlock {
                serial,
                text: &content[start..],
                terminated: false,
            }),
            suffix: "",
        },
        None => SplitContent {
            prefix: content,
            block: None,
            suffix: "",
        },
    }
}

/// Serial of the managed block, if there is one with a readable header
#[must_use]
pub fn managed_serial(content: &str) -> Option<u64> {
    split_managed(content).block.and_then(|block| block.serial)
}

fn assemble(prefix: &str, block: &str, suffix: &str) -> String {
    let mut out = String::with_capacity(prefix.len() + block.len() + suffix.len() + 2);
    out.push_str(prefix);
    if !block.is_empty() {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(block);
        if !block.ends_with('\n') && !suffix.is_empty() {
            out.push('\n');
        }
    }
    out.push_str(suffix);
    out
}

/// Swap the managed block for `new_block`
///
/// An empty `new_block` drops the block, header and footer included. A file
/// without a block gets the new one appended.
#[must_use]
pub fn replace_managed(content: &str, new_block: &str) -> String {
    let split = split_managed(content);
    if split.block.is_some() {
        assemble(split.prefix, new_block, split.suffix)
    } else {
        assemble(content, new_block, "")
    }
}

/// Drop every non-comment line carrying the key material of `public_line`
///
/// Returns `None` when no line matched.
#[must_use]
pub fn remove_key_line(content: &str, public_line: &str) -> Option<String> {
    let key_data = public_line.split_whitespace().nth(1)?;
    let mut removed = false;
    let mut out = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        let matches = !line.trim_start().starts_with('#')
            && line.split_whitespace().any(|token| token == key_data);
        if matches {
            removed = true;
        } else {
            out.push_str(line);
        }
    }

    removed.then_some(out)
}
