//! Peer Wire Codec
//!
//! XML bodies exchanged between cache nodes.
//!
//! ```text
//! legacy:     <body><asset>{base64}</asset></body>
//! versioned:  <body><asset>
//!               <version>1</version><data>{base64}</data>
//!               <id/><fullid/><name/><desc/><type/><ctype/><local/><temp/>
//!             </asset></body>
//! ```

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::asset::{Asset, AssetId, AssetType};
use crate::error::{Error, Result};

/// Current wire version
pub const WIRE_VERSION: u32 = 1;

const ASSET_PATH: &str = "body.asset";

/// Encode an asset in the versioned form
pub fn encode_asset(asset: &Asset) -> String {
    let id = asset.id.to_string();
    format!(
        "<body><asset>\
         <version>{}</version>\
         <data>{}</data>\
         <id>{}</id>\
         <fullid>{}</fullid>\
         <name>{}</name>\
         <desc>{}</desc>\
         <type>{}</type>\
         <ctype>{}</ctype>\
         <local>{}</local>\
         <temp>{}</temp>\
         </asset></body>",
        WIRE_VERSION,
        STANDARD.encode(&asset.data),
        id,
        id,
        escape(asset.name.as_str()),
        escape(asset.description.as_str()),
        asset.asset_type.code(),
        escape(asset.content_type.as_str()),
        wire_bool(asset.local),
        wire_bool(asset.temporary),
    )
}

/// Encode an asset in the legacy payload-only form
pub fn encode_legacy(asset: &Asset) -> String {
    format!("<body><asset>{}</asset></body>", STANDARD.encode(&asset.data))
}

fn wire_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

/// Decode a peer response for `requested`.
///
/// Fields a legacy body cannot carry take their defaults and the id is the
/// one requested.
pub fn decode_asset(body: &str, requested: AssetId) -> Result<Asset> {
    let doc = FlatDocument::parse(body)?;

    let Some(asset_text) = doc.fields.get(ASSET_PATH) else {
        return Err(malformed("missing <body><asset> element"));
    };

    if !doc.asset_has_children {
        let data = decode_base64(asset_text)?;
        return Ok(Asset::new(requested, AssetType::default(), data));
    }

    let version = match doc.field("version") {
        Some(text) => text
            .trim()
            .parse::<u32>()
            .map_err(|_| malformed(format!("unparsable version '{}'", text)))?,
        None => return Err(malformed("asset element has children but no version")),
    };
    if version < WIRE_VERSION {
        return Err(malformed(format!("unsupported wire version {}", version)));
    }

    if let Some(fullid) = doc.field("fullid") {
        let fullid: AssetId = fullid
            .parse()
            .map_err(|_| malformed(format!("unparsable fullid '{}'", fullid)))?;
        if fullid != requested {
            return Err(malformed(format!(
                "fullid {} does not match requested {}",
                fullid, requested
            )));
        }
    }

    let data = match doc.field("data") {
        Some(text) => decode_base64(text)?,
        None => Vec::new(),
    };
    let asset_type = match doc.field("type") {
        Some(text) => AssetType(
            text.trim()
                .parse::<i8>()
                .map_err(|_| malformed(format!("unparsable type '{}'", text)))?,
        ),
        None => AssetType::default(),
    };

    let text = |name: &str| doc.field(name).unwrap_or_default().to_string();
    Ok(Asset::new(requested, asset_type, data)
        .with_name(text("name"))
        .with_description(text("desc"))
        .with_content_type(text("ctype"))
        .local(parse_bool(doc.field("local")))
        .temporary(parse_bool(doc.field("temp"))))
}

fn parse_bool(text: Option<&str>) -> bool {
    text.map(|t| t.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn decode_base64(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|e| malformed(format!("bad base64 payload: {}", e)))
}

fn malformed(msg: impl Into<String>) -> Error {
    Error::MalformedPeerResponse(msg.into())
}

/// Text content keyed by dotted element path
struct FlatDocument {
    fields: HashMap<String, String>,
    asset_has_children: bool,
}

impl FlatDocument {
    fn parse(body: &str) -> Result<Self> {
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(true);

        let mut path: Vec<String> = Vec::new();
        let mut fields: HashMap<String, String> = HashMap::new();
        let mut asset_has_children = false;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| malformed(format!("invalid XML: {}", e)))?;
            match event {
                Event::Start(e) => {
                    if path.join(".") == ASSET_PATH {
                        asset_has_children = true;
                    }
                    path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                    fields.entry(path.join(".")).or_default();
                }
                Event::Empty(e) => {
                    if path.join(".") == ASSET_PATH {
                        asset_has_children = true;
                    }
                    let mut key = path.join(".");
                    if !key.is_empty() {
                        key.push('.');
                    }
                    key.push_str(&String::from_utf8_lossy(e.name().as_ref()));
                    fields.entry(key).or_default();
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(t) => {
                    let text = t
                        .unescape()
                        .map_err(|e| malformed(format!("invalid XML text: {}", e)))?;
                    fields.entry(path.join(".")).or_default().push_str(&text);
                }
                Event::CData(c) => {
                    let raw = c.into_inner();
                    fields
                        .entry(path.join("."))
                        .or_default()
                        .push_str(&String::from_utf8_lossy(&raw));
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self {
            fields,
            asset_has_children,
        })
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(&format!("{}.{}", ASSET_PATH, name))
            .map(String::as_str)
    }
}

// =============================================================================
// Tests
// =============================================================================
