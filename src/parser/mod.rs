pub mod sections;

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One identifier's structured record: four raw-markup sections plus the
/// derived origpath. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedRecord {
    pub identifier: String,
    #[serde(rename = "dc.identifier.origpath")]
    pub origpath: Option<String>,
    pub section1: String,
    pub section2: String,
    pub section3: String,
    pub section4: String,
}

/// Build the record for one identifier from its two stored pages.
/// Returns `None` if either source file is missing or unreadable; a missing
/// section inside a readable document is not a failure.
pub fn process_identifier(
    identifier: &str,
    details_dir: &Path,
    download_dir: &Path,
) -> Option<ExtractedRecord> {
    let details_file = details_dir.join(format!("{identifier}.html"));
    let download_file = download_dir.join(format!("{identifier}.html"));

    if !details_file.exists() {
        warn!("missing details file for {}", identifier);
        return None;
    }
    if !download_file.exists() {
        warn!("missing download file for {}", identifier);
        return None;
    }

    let details_html = match fs::read_to_string(&details_file) {
        Ok(html) => html,
        Err(e) => {
            warn!("error reading {}: {}", details_file.display(), e);
            return None;
        }
    };
    let download_html = match fs::read_to_string(&download_file) {
        Ok(html) => html,
        Err(e) => {
            warn!("error reading {}: {}", download_file.display(), e);
            return None;
        }
    };

    let details = sections::parse_details(&details_html);
    let origpath = if details.description.is_empty() {
        None
    } else {
        sections::find_origpath(&details.description)
    };

    Some(ExtractedRecord {
        identifier: identifier.to_string(),
        origpath,
        section1: details.metadata_list,
        section2: details.description,
        section3: details.expandable_list,
        section4: sections::parse_download(&download_html),
    })
}

// ── Tests ──
