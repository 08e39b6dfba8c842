//! Label encoding and page arithmetic for the tunnel.
//!
//! Everything that crosses a DNS label boundary is base32 without padding
//! (RFC 4648 alphabet, lower-cased on the wire since DNS names are
//! case-insensitive). The numbers here are the whole protocol's encoding
//! cliff: a 63-character label decodes to at most 39 raw bytes, a session id
//! is exactly 26 characters, and no constructed name may exceed 255 bytes.

use data_encoding::BASE32_NOPAD;

use crate::error::GatewayError;

/// DNS caps a single label at 63 octets.
pub const MAX_LABEL_CHARS: usize = 63;

/// Raw payload bytes that fit one data label: floor(63 * 5 / 8).
pub const RAW_BYTES_PER_LABEL: usize = 39;

/// Cap on a full presentation-format name.
pub const MAX_NAME_BYTES: usize = 255;

/// Session ids are 128-bit.
pub const SESSION_ID_BYTES: usize = 16;

/// base32(16 bytes) without padding: ceil(128 / 5).
pub const SESSION_ID_CHARS: usize = 26;

/// Response pages carry exactly this many Unicode code points of body.
pub const PAGE_CODE_POINTS: usize = 400;

/// Encode bytes as an unpadded lower-case base32 label.
pub fn encode_label(raw: &[u8]) -> String {
    BASE32_NOPAD.encode(raw).to_ascii_lowercase()
}

/// Decode an unpadded base32 label (either case).
pub fn decode_label(label: &str) -> Result<Vec<u8>, GatewayError> {
    BASE32_NOPAD
        .decode(label.to_ascii_uppercase().as_bytes())
        .map_err(|e| GatewayError::Protocol(format!("invalid base32 label `{label}`: {e}")))
}

/// Split a response body into pages of [`PAGE_CODE_POINTS`] code points.
///
/// An empty body still produces one (empty) page, so every response has at
/// least page 1.
pub fn paginate(text: &str) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(PAGE_CODE_POINTS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Prefix a page body with its 1-based position marker.
pub fn frame_page(index: usize, total: usize, body: &str) -> String {
    format!("[Page {}/{}]{}", index + 1, total, body)
}

/// Strip a `[Page i/N]` marker, returning the body. `None` when unframed.
pub fn strip_frame(page: &str) -> Option<&str> {
    let rest = page.strip_prefix("[Page ")?;
    let close = rest.find(']')?;
    Some(&rest[close + 1..])
}

/// Split a raw query into the per-label chunks a client sends.
pub fn split_query(data: &[u8]) -> Vec<&[u8]> {
    if data.is_empty() {
        return vec![&[]];
    }
    data.chunks(RAW_BYTES_PER_LABEL).collect()
}

/// Construct the query-page name `<sid>.<idx>.<data>.<zone>` a client would
/// send, enforcing every label and total-length cap. Exists so the sizing
/// arithmetic is tested from the same code a client embedding would use.
pub fn build_page_name(
    session_id: &str,
    index: u8,
    chunk: &[u8],
    zone: &str,
) -> Result<String, GatewayError> {
    if chunk.len() > RAW_BYTES_PER_LABEL {
        return Err(GatewayError::Protocol(format!(
            "page chunk of {} bytes exceeds the {RAW_BYTES_PER_LABEL}-byte label budget",
            chunk.len()
        )));
    }
    let name = format!(
        "{session_id}.{}.{}.{zone}",
        encode_label(&[index]),
        encode_label(chunk)
    );
    for label in name.split('.') {
        if label.len() > MAX_LABEL_CHARS {
            return Err(GatewayError::Protocol(format!(
                "label `{label}` exceeds {MAX_LABEL_CHARS} bytes"
            )));
        }
    }
    if name.len() > MAX_NAME_BYTES {
        return Err(GatewayError::Protocol(format!(
            "constructed name is {} bytes, over the {MAX_NAME_BYTES}-byte cap",
            name.len()
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // base32 round-trips
    // -----------------------------------------------------------------------

    #[test]
    fn label_round_trips_arbitrary_bytes() {
        let cases: Vec<Vec<u8>> = vec![
            vec![],
            vec![0],
            vec![0xff; 39],
            (0..=255u8).collect(),
            b"what is DNS".to_vec(),
        ];
        for raw in cases {
            let label = encode_label(&raw);
            assert_eq!(decode_label(&label).unwrap(), raw);
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        }
    }

    #[test]
    fn session_id_encodes_to_26_characters() {
        assert_eq!(encode_label(&[0u8; SESSION_ID_BYTES]).len(), SESSION_ID_CHARS);
    }

    #[test]
    fn full_data_label_stays_within_63_characters() {
        let label = encode_label(&[0xab; RAW_BYTES_PER_LABEL]);
        assert!(label.len() <= MAX_LABEL_CHARS, "39 bytes → {} chars", label.len());
    }

    #[test]
    fn decode_rejects_invalid_alphabet() {
        assert!(decode_label("not base32 at all!").is_err());
        // '1' and '8' are outside the RFC 4648 base32 alphabet.
        assert!(decode_label("abc18").is_err());
    }

    // -----------------------------------------------------------------------
    // Query splitting boundaries
    // -----------------------------------------------------------------------

    #[test]
    fn query_of_exactly_39_bytes_fills_one_label() {
        let data = vec![b'x'; 39];
        let chunks = split_query(&data);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 39);
    }

    #[test]
    fn query_of_40_bytes_spills_one_byte_into_a_second_page() {
        let data = vec![b'x'; 40];
        let chunks = split_query(&data);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 39);
        assert_eq!(chunks[1].len(), 1);
    }

    #[test]
    fn queries_of_1512_bytes_need_39_pages() {
        let data = vec![b'q'; 1512];
        assert_eq!(split_query(&data).len(), 39);
    }

    // -----------------------------------------------------------------------
    // Pagination boundaries
    // -----------------------------------------------------------------------

    #[test]
    fn empty_response_is_one_empty_page() {
        let pages = paginate("");
        assert_eq!(pages, vec![String::new()]);
    }

    #[test]
    fn response_of_exactly_400_code_points_is_one_page() {
        let text = "é".repeat(400); // multi-byte chars: counts are per code point
        let pages = paginate(&text);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].chars().count(), 400);
    }

    #[test]
    fn response_of_401_code_points_spills_into_a_second_page() {
        let text = "x".repeat(401);
        let pages = paginate(&text);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1], "x");
    }

    #[test]
    fn pagination_concatenation_reproduces_the_original() {
        let text = "The quick brown fox — ∀x∃y. ".repeat(60);
        let pages = paginate(&text);
        assert_eq!(pages.concat(), text);
    }

    // -----------------------------------------------------------------------
    // Page framing
    // -----------------------------------------------------------------------

    #[test]
    fn frame_is_one_based_and_strippable() {
        let framed = frame_page(0, 3, "body text");
        assert!(framed.starts_with("[Page 1/3]"));
        assert_eq!(strip_frame(&framed), Some("body text"));
    }

    #[test]
    fn framed_pages_reassemble_exactly() {
        let original = "a".repeat(950);
        let pages = paginate(&original);
        let total = pages.len();
        let reassembled: String = pages
            .iter()
            .enumerate()
            .map(|(i, p)| strip_frame(&frame_page(i, total, p)).unwrap().to_string())
            .collect();
        assert_eq!(reassembled, original);
    }

    // -----------------------------------------------------------------------
    // Name construction limits
    // -----------------------------------------------------------------------

    #[test]
    fn constructed_page_names_stay_under_255_bytes() {
        let sid = encode_label(&[7u8; SESSION_ID_BYTES]);
        let zone = "qp.q.example.com";
        let chunk = vec![0xaa; RAW_BYTES_PER_LABEL];
        let name = build_page_name(&sid, 255, &chunk, zone).unwrap();
        assert!(name.len() <= MAX_NAME_BYTES);
        assert!(name.ends_with(zone));
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let sid = encode_label(&[7u8; SESSION_ID_BYTES]);
        let err = build_page_name(&sid, 0, &[0u8; 40], "qp.example.com").unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn absurd_zone_overflows_the_name_cap() {
        let sid = encode_label(&[7u8; SESSION_ID_BYTES]);
        let zone = format!("{}.{}.{}.example.com", "a".repeat(60), "b".repeat(60), "c".repeat(60));
        let err = build_page_name(&sid, 0, &[0u8; RAW_BYTES_PER_LABEL], &zone).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }
}
