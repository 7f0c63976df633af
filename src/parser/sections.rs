use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};

static ORIGPATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)dc\.identifier\.origpath:\s*(/.+)").unwrap());

static METADATA_LIST_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"div.row.metadata-list[role="list"]"#).unwrap());
static DESCRIPTION_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"div#descript[itemprop="description"]"#).unwrap());
static EXPANDABLE_LIST_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"div.metadata-expandable-list.row[role="list"]"#).unwrap());
static FILE_TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table.directory-listing-table").unwrap());

/// Raw markup of the three structural regions of a details page.
/// A region that is absent from the document comes back as `""`.
#[derive(Debug, Default)]
pub struct DetailsSections {
    pub metadata_list: String,
    pub description: String,
    pub expandable_list: String,
}

pub fn parse_details(html: &str) -> DetailsSections {
    let doc = Html::parse_document(html);
    DetailsSections {
        metadata_list: first_outer_html(&doc, &METADATA_LIST_SEL),
        description: first_outer_html(&doc, &DESCRIPTION_SEL),
        expandable_list: first_outer_html(&doc, &EXPANDABLE_LIST_SEL),
    }
}

/// The directory-listing table of a download page, or `""` if absent.
pub fn parse_download(html: &str) -> String {
    let doc = Html::parse_document(html);
    first_outer_html(&doc, &FILE_TABLE_SEL)
}

fn first_outer_html(doc: &Html, selector: &Selector) -> String {
    doc.select(selector)
        .next()
        .map(|el| el.html())
        .unwrap_or_default()
}

/// Scan a description block for the `dc.identifier.origpath:` label followed
/// by an absolute path. First match wins; absence is not an error.
pub fn find_origpath(description_html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(description_html);
    let text: Vec<&str> = fragment.root_element().text().collect();
    let joined = text.join("\n");
    ORIGPATH_RE
        .captures(&joined)
        .map(|caps| caps[1].trim().to_string())
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    const DETAILS: &str = r#"
        <html><body>
        <div class="container">
          <div class="row metadata-list" role="list">
            <dl><dt>Publisher</dt><dd>Unknown</dd></dl>
          </div>
          <div id="descript" itemprop="description">
            Scanned document.<br>
            dc.identifier.origpath: /5/items/foo/bar.pdf
          </div>
          <div class="metadata-expandable-list row" role="list">
            <dl><dt>Scanner</dt><dd>ttscribe</dd></dl>
          </div>
        </div>
        </body></html>"#;

    const DOWNLOAD: &str = r#"
        <html><body>
        <table class="directory-listing-table">
          <tr><td><a href="bar.pdf">bar.pdf</a></td><td>12-Jan-2020</td></tr>
        </table>
        </body></html>"#;

    #[test]
    fn details_sections_found() {
        let s = parse_details(DETAILS);
        assert!(s.metadata_list.contains("Publisher"));
        assert!(s.description.contains("Scanned document"));
        assert!(s.expandable_list.contains("ttscribe"));
    }

    #[test]
    fn sections_carry_outer_markup() {
        let s = parse_details(DETAILS);
        assert!(s.metadata_list.starts_with("<div"));
        assert!(s.description.contains(r#"id="descript""#));
    }

    #[test]
    fn missing_description_is_empty_string() {
        let s = parse_details("<html><body><p>nothing here</p></body></html>");
        assert_eq!(s.metadata_list, "");
        assert_eq!(s.description, "");
        assert_eq!(s.expandable_list, "");
    }

    #[test]
    fn download_table_found() {
        let table = parse_download(DOWNLOAD);
        assert!(table.starts_with("<table"));
        assert!(table.contains("bar.pdf"));
    }

    #[test]
    fn download_table_absent_is_empty() {
        assert_eq!(parse_download("<html><body></body></html>"), "");
    }

    #[test]
    fn origpath_extracted() {
        let s = parse_details(DETAILS);
        assert_eq!(
            find_origpath(&s.description).as_deref(),
            Some("/5/items/foo/bar.pdf")
        );
    }

    #[test]
    fn origpath_is_case_insensitive() {
        let html = "<div>DC.Identifier.Origpath: /1/items/x/y.xml</div>";
        assert_eq!(find_origpath(html).as_deref(), Some("/1/items/x/y.xml"));
    }

    #[test]
    fn origpath_first_match_wins() {
        let html = "<div>dc.identifier.origpath: /first/a.pdf\n\
                    dc.identifier.origpath: /second/b.pdf</div>";
        assert_eq!(find_origpath(html).as_deref(), Some("/first/a.pdf"));
    }

    #[test]
    fn origpath_requires_absolute_path() {
        let html = "<div>dc.identifier.origpath: relative/path.pdf</div>";
        assert_eq!(find_origpath(html), None);
    }

    #[test]
    fn origpath_absent_is_none() {
        assert_eq!(find_origpath("<div>no label here</div>"), None);
    }
}
