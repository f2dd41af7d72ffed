use anyhow::{anyhow, Result};
use std::iter::FromIterator;

pub type StringPair = (String, String);

pub fn parse_key_value_pair_lines<'a, T, U>(lines: T, separator: &str) -> Result<U>
where
    T: Iterator<Item = &'a str>,
    U: FromIterator<StringPair>,
{
    lines
        .map(|line| parse_key_value_pair_line(line, separator))
        .collect::<Result<U>>()
}

fn parse_key_value_pair_line(line: &str, separator: &str) -> Result<StringPair> {
    let parts: Vec<&str> = line.splitn(2, separator).collect();
    match parts.len() {
        2 => Ok((parts[0].trim().to_string(), parts[1].trim().to_string())),
        _ => Err(anyhow!("Invalid line in key value pair data.")),
    }
}

/// Extracts the attribute block of a `btrfs subvolume show` dump as key/value
/// pairs. The leading line is the subvolume path, not an attribute, and the
/// block ends where the snapshot list starts.
pub fn show_block_pairs(data: &str) -> Result<Vec<StringPair>> {
    parse_key_value_pair_lines(
        data.lines()
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .take_while(|line| !line.starts_with("Snapshot(s)")),
        ":",
    )
}

/// Splits one row of `btrfs subvolume list -t` tabular output. Header and
/// separator rows do not yield the expected all-numeric leading columns and
/// are rejected by the caller.
pub fn table_row_fields(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}
