use std::io::{BufRead, Write};

use crate::core::ChatError;

/// Prints `prompt` and reads one trimmed line. End of input reads as empty.
pub fn prompt<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    prompt: &str,
) -> Result<String, ChatError> {
    write!(writer, "{prompt} ")?;
    writer.flush()?;
    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Asks a yes/no question until answered. End of input counts as "no".
pub fn confirm<R: BufRead, W: Write>(
    reader: &mut R,
    writer: &mut W,
    question: &str,
) -> Result<bool, ChatError> {
    loop {
        let mut line = String::new();
        write!(writer, "{question} (y/n) ")?;
        writer.flush()?;
        if reader.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim().to_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => {}
        }
    }
}
