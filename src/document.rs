//! removal of device blocks from OVF hardware descriptors
//!
//! a device block is an `<Item>` element (any namespace prefix) inside the
//! virtual hardware section, identified by the text of its `ElementName`
//! child, e.g. `<rasd:ElementName>ethernet0</rasd:ElementName>`.
//!
//! the document is scanned rather than parsed and re-serialized, so every
//! byte outside the removed block is preserved exactly.

use crate::error::{Error, Result};

const BLOCK_ELEMENT: &str = "Item";
const ID_ELEMENT: &str = "ElementName";

/// a located device block
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block<'a> {
    /// byte offset of the opening `<`
    pub start: usize,
    /// byte offset just past the closing `>`
    pub end: usize,
    /// trimmed `ElementName` text, if the block has one
    pub id: Option<&'a str>,
}

/// remove the single block identified by `block_id`.
///
/// zero matches is `ElementNotFound`, more than one is
/// `MultipleElementsFound`. exactly the element's bytes are removed;
/// surrounding whitespace and line breaks stay as they were.
pub fn remove_block(document: &str, block_id: &str) -> Result<String> {
    let blocks = find_blocks(document)?;
    let matches: Vec<&Block<'_>> = blocks.iter().filter(|b| b.id == Some(block_id)).collect();

    let block = match matches.as_slice() {
        [] => return Err(Error::ElementNotFound(block_id.to_string())),
        [one] => *one,
        many => {
            return Err(Error::MultipleElementsFound {
                id: block_id.to_string(),
                count: many.len(),
            })
        }
    };

    let (start, end) = (block.start, block.end);
    tracing::debug!(id = block_id, start, end, "removing block");

    let mut out = String::with_capacity(document.len() - (end - start));
    out.push_str(&document[..start]);
    out.push_str(&document[end..]);
    Ok(out)
}

/// find every device block in the document, in order
pub fn find_blocks(document: &str) -> Result<Vec<Block<'_>>> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while let Some(tag) = next_tag(document, pos)? {
        pos = tag.end;
        if tag.closing || local_name(tag.name) != BLOCK_ELEMENT {
            continue;
        }

        if tag.self_closing {
            blocks.push(Block {
                start: tag.start,
                end: tag.end,
                id: None,
            });
            continue;
        }

        let (inner_end, end) = find_close(document, tag.end, tag.name).ok_or_else(|| {
            Error::MalformedDocument(format!("unterminated <{}> at byte {}", tag.name, tag.start))
        })?;
        let id = element_text(document, tag.end, inner_end, ID_ELEMENT)?;
        blocks.push(Block {
            start: tag.start,
            end,
            id,
        });
        pos = end;
    }

    Ok(blocks)
}

struct Tag<'a> {
    start: usize,
    end: usize,
    name: &'a str,
    closing: bool,
    self_closing: bool,
}

fn local_name(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

/// next element tag at or after `from`, skipping comments, CDATA,
/// processing instructions and declarations
fn next_tag(doc: &str, from: usize) -> Result<Option<Tag<'_>>> {
    let bytes = doc.as_bytes();
    let mut pos = from;

    loop {
        let start = match doc[pos..].find('<') {
            Some(i) => pos + i,
            None => return Ok(None),
        };
        let rest = &doc[start..];

        let skip_to = |terminator: &str| -> Result<usize> {
            rest.find(terminator)
                .map(|i| start + i + terminator.len())
                .ok_or_else(|| {
                    Error::MalformedDocument(format!("unterminated markup at byte {}", start))
                })
        };

        if rest.starts_with("<!--") {
            pos = skip_to("-->")?;
            continue;
        }
        if rest.starts_with("<![CDATA[") {
            pos = skip_to("]]>")?;
            continue;
        }
        if rest.starts_with("<?") || rest.starts_with("<!") {
            pos = skip_to(">")?;
            continue;
        }

        let end = tag_end(doc, start).ok_or_else(|| {
            Error::MalformedDocument(format!("unterminated tag at byte {}", start))
        })?;

        let closing = bytes.get(start + 1) == Some(&b'/');
        let name_start = if closing { start + 2 } else { start + 1 };
        let name_len = doc[name_start..end]
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(end - name_start);
        let name = &doc[name_start..name_start + name_len];
        let self_closing = !closing && end >= 2 && bytes[end - 2] == b'/';

        return Ok(Some(Tag {
            start,
            end,
            name,
            closing,
            self_closing,
        }));
    }
}

/// offset just past the `>` closing the tag that opens at `start`,
/// ignoring `>` inside quoted attribute values
fn tag_end(doc: &str, start: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in doc.as_bytes()[start..].iter().enumerate() {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(b),
            (None, b'>') => return Some(start + i + 1),
            _ => {}
        }
    }
    None
}

/// locate `</name>` after `from`. returns (offset of `</`, offset past `>`).
fn find_close(doc: &str, from: usize, name: &str) -> Option<(usize, usize)> {
    let mut pos = from;
    while let Ok(Some(tag)) = next_tag(doc, pos) {
        if tag.closing && tag.name == name {
            return Some((tag.start, tag.end));
        }
        pos = tag.end;
    }
    None
}

/// trimmed text of the first element with local name `local` in `[from, to)`
fn element_text<'a>(doc: &'a str, from: usize, to: usize, local: &str) -> Result<Option<&'a str>> {
    let scope = &doc[..to];
    let mut pos = from;
    while let Some(tag) = next_tag(scope, pos)? {
        pos = tag.end;
        if tag.closing || tag.self_closing || local_name(tag.name) != local {
            continue;
        }
        let text_end = scope[tag.end..].find('<').map(|i| tag.end + i).unwrap_or(to);
        return Ok(Some(scope[tag.end..text_end].trim()));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope vmw:buildId="build-123" xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData">
  <VirtualSystem ovf:id="vm">
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
"#;

    const CONTROLLER: &str = r#"      <Item>
        <rasd:Address>0</rasd:Address>
        <rasd:ElementName>scsiController0</rasd:ElementName>
        <rasd:InstanceID>3</rasd:InstanceID>
        <rasd:ResourceSubType>lsilogicsas</rasd:ResourceSubType>
        <rasd:ResourceType>6</rasd:ResourceType>
      </Item>
"#;

    const ETHERNET: &str = r#"      <Item>
        <rasd:AddressOnParent>7</rasd:AddressOnParent>
        <rasd:AutomaticAllocation>true</rasd:AutomaticAllocation>
        <rasd:Connection>VM Network</rasd:Connection>
        <rasd:Description>E1000 ethernet adapter on "VM Network"</rasd:Description>
        <rasd:ElementName>ethernet0</rasd:ElementName>
        <rasd:InstanceID>8</rasd:InstanceID>
        <rasd:ResourceSubType>E1000</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
"#;

    // what is left where ETHERNET was: its indentation and line break
    const ETHERNET_REMAINS: &str = "      \n";

    const FOOTER: &str = r#"    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>
"#;

    fn doc(items: &[&str]) -> String {
        let mut s = HEADER.to_string();
        for item in items {
            s.push_str(item);
        }
        s.push_str(FOOTER);
        s
    }

    #[test]
    fn test_removes_single_block() {
        let orig = doc(&[CONTROLLER, ETHERNET, CONTROLLER]);
        let want = doc(&[CONTROLLER, ETHERNET_REMAINS, CONTROLLER]);
        assert_eq!(remove_block(&orig, "ethernet0").unwrap(), want);
    }

    #[test]
    fn test_removal_is_not_repeatable() {
        let once = remove_block(&doc(&[ETHERNET]), "ethernet0").unwrap();
        assert!(matches!(
            remove_block(&once, "ethernet0"),
            Err(Error::ElementNotFound(_))
        ));
    }

    #[test]
    fn test_missing_block() {
        assert!(matches!(
            remove_block(&doc(&[CONTROLLER]), "ethernet0"),
            Err(Error::ElementNotFound(ref id)) if id == "ethernet0"
        ));
    }

    #[test]
    fn test_multiple_blocks() {
        let orig = doc(&[ETHERNET, CONTROLLER, ETHERNET]);
        assert!(matches!(
            remove_block(&orig, "ethernet0"),
            Err(Error::MultipleElementsFound { count: 2, .. })
        ));
    }

    #[test]
    fn test_matches_identifier_exactly() {
        let ethernet10 = ETHERNET.replace("ethernet0", "ethernet10");
        let orig = doc(&[&ethernet10]);
        assert!(matches!(
            remove_block(&orig, "ethernet0"),
            Err(Error::ElementNotFound(_))
        ));
        // also not fooled by the identifier in free text
        let orig = doc(&[CONTROLLER]).replace("Virtual hardware requirements", "ethernet0");
        assert!(matches!(
            remove_block(&orig, "ethernet0"),
            Err(Error::ElementNotFound(_))
        ));
    }

    #[test]
    fn test_ignores_commented_out_blocks() {
        let commented = format!("      <!--\n{}      -->\n", ETHERNET);
        let orig = doc(&[&commented, ETHERNET]);
        let want = doc(&[&commented, ETHERNET_REMAINS]);
        assert_eq!(remove_block(&orig, "ethernet0").unwrap(), want);
    }

    #[test]
    fn test_inline_block_removes_only_its_span() {
        let orig = "<a><Item><ElementName>x</ElementName></Item><b/></a>";
        assert_eq!(remove_block(orig, "x").unwrap(), "<a><b/></a>");
    }

    #[test]
    fn test_prefixed_items_and_quoted_gt() {
        let orig = "<ovf:Item note=\"a>b\">\n<rasd:ElementName> disk0 </rasd:ElementName>\n</ovf:Item>\n<ovf:Item/>\n";
        let blocks = find_blocks(orig).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id, Some("disk0"));
        assert_eq!(blocks[1].id, None);
        assert_eq!(remove_block(orig, "disk0").unwrap(), "\n<ovf:Item/>\n");
    }

    #[test]
    fn test_keeps_whitespace_around_block() {
        let orig = "<VirtualHardwareSection>\n  <Item><ElementName>ethernet0</ElementName></Item>\n</VirtualHardwareSection>\n";
        assert_eq!(
            remove_block(orig, "ethernet0").unwrap(),
            "<VirtualHardwareSection>\n  \n</VirtualHardwareSection>\n"
        );

        let orig = "<a>\r\n\t<Item><ElementName>x</ElementName></Item>  \r\n</a>";
        assert_eq!(remove_block(orig, "x").unwrap(), "<a>\r\n\t  \r\n</a>");
    }

    #[test]
    fn test_unterminated_block_is_malformed() {
        let orig = "<Envelope>\n  <Item>\n    <ElementName>ethernet0</ElementName>\n</Envelope>\n";
        assert!(matches!(
            remove_block(orig, "ethernet0"),
            Err(Error::MalformedDocument(_))
        ));
    }

    #[test]
    fn test_other_item_like_names_are_not_blocks() {
        let orig = "<Items><ItemGroup><ElementName>ethernet0</ElementName></ItemGroup></Items>";
        assert!(find_blocks(orig).unwrap().is_empty());
    }
}
