use std::collections::HashSet;

use log::{error, warn};

use crate::error::{Error, Result};
use crate::layout::{LIST_ENTRY, Layout};
use crate::memory::Target;

/// Upper bound on the entries collected from a single list
pub const MAX_LIST_ENTRIES: usize = 0x4000;

/// Collect the records linked from the `_LIST_ENTRY` at `head`.
///
/// Each record embeds its link at `structure.link_field`; the returned addresses point at
/// the start of the records. The walk stops at the head, a null link, a repeated entry, or
/// after [`MAX_LIST_ENTRIES`]. A broken link truncates the list and is logged.
pub fn list_records(
    target: &dyn Target,
    layout: &Layout,
    head: u64,
    structure: &str,
    link_field: &str,
) -> Result<Vec<u64>> {
    let link_offset = layout.offset_of(structure, link_field)?;
    let flink = layout.offset_of(LIST_ENTRY, "Flink")?;

    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut entry = target.read_pointer(head.wrapping_add(flink))?;

    while entry != head {
        if entry == 0 {
            warn!("{}", Error::MalformedList { head, reason: "null link".to_owned() });
            break;
        }
        if !seen.insert(entry) {
            warn!(
                "{}",
                Error::MalformedList { head, reason: format!("entry 0x{entry:x} repeats") }
            );
            break;
        }
        if records.len() == MAX_LIST_ENTRIES {
            warn!(
                "{}",
                Error::MalformedList { head, reason: format!("more than {MAX_LIST_ENTRIES} entries") }
            );
            break;
        }

        records.push(entry.wrapping_sub(link_offset));
        entry = match target.read_pointer(entry.wrapping_add(flink)) {
            Ok(next) => next,
            Err(e) => {
                error!("list at 0x{head:x} truncated: {e}");
                break;
            }
        };
    }

    Ok(records)
}
