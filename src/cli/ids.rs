use crate::core::ChatError;

/// Most ids a single list may name.
pub const MAX_IDS: usize = 1000;

/// Parses a list of ids such as `"1-3, 5, 7"`; ranges are inclusive and
/// duplicates are dropped. Lists naming more than [`MAX_IDS`] ids are rejected.
pub fn parse_id_list(input: &str) -> Result<Vec<i64>, ChatError> {
    let mut ids = Vec::new();

    for part in input.split(',').map(str::trim) {
        if part.is_empty() {
            return Err(invalid(input));
        }
        match part.split_once('-') {
            Some((start, end)) => {
                let start = parse_id(start, input)?;
                let end = parse_id(end, input)?;
                if start > end {
                    return Err(ChatError::InvalidInput(format!(
                        "Range {part} runs backwards"
                    )));
                }
                let span = usize::try_from(end - start).unwrap_or(usize::MAX);
                if span >= MAX_IDS.saturating_sub(ids.len()) {
                    return Err(too_many());
                }
                ids.extend(start..=end);
            }
            None => {
                if ids.len() >= MAX_IDS {
                    return Err(too_many());
                }
                ids.push(parse_id(part, input)?);
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(*id));
    Ok(ids)
}

fn parse_id(value: &str, input: &str) -> Result<i64, ChatError> {
    value.trim().parse().map_err(|_| invalid(input))
}

fn too_many() -> ChatError {
    ChatError::InvalidInput(format!("Too many ids, at most {MAX_IDS} can be given at once"))
}

fn invalid(input: &str) -> ChatError {
    ChatError::InvalidInput(format!("Invalid id list {input:?}, expected e.g. \"1-3, 5\""))
}
