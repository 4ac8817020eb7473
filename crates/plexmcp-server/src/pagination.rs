//! Opaque cursor pagination for list endpoints.
//!
//! Cursors are base64-wrapped sort keys. Clients must treat them as opaque
//! tokens; a stale or unknown cursor restarts from the beginning rather
//! than erroring, so pagination stays stable across registry mutations.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Encode a sort key into an opaque cursor
pub fn encode_cursor(key: &str) -> String {
    URL_SAFE_NO_PAD.encode(key.as_bytes())
}

/// Decode an opaque cursor back into its sort key
pub fn decode_cursor(cursor: &str) -> Option<String> {
    let bytes = URL_SAFE_NO_PAD.decode(cursor).ok()?;
    String::from_utf8(bytes).ok()
}

/// Page through `items` (already sorted by `key`) starting after the entry
/// named by `cursor`. Returns the page plus the cursor for the next one.
pub fn paginate<T, K>(
    items: &[T],
    cursor: Option<&str>,
    page_size: usize,
    key: K,
) -> (Vec<T>, Option<String>)
where
    T: Clone,
    K: Fn(&T) -> String,
{
    let start = cursor
        .and_then(decode_cursor)
        .and_then(|last| items.iter().position(|item| key(item) == last).map(|i| i + 1))
        .unwrap_or(0);
    let page: Vec<T> = items.iter().skip(start).take(page_size).cloned().collect();
    let next = if start + page.len() < items.len() {
        page.last().map(|item| encode_cursor(&key(item)))
    } else {
        None
    };
    (page, next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip() {
        let cursor = encode_cursor("echo");
        assert_eq!(decode_cursor(&cursor).as_deref(), Some("echo"));
        assert!(decode_cursor("!!!not-base64!!!").is_none());
    }

    #[test]
    fn pages_are_disjoint_and_complete() {
        let items: Vec<String> = (0..7).map(|i| format!("item-{i}")).collect();
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let (page, next) = paginate(&items, cursor.as_deref(), 3, Clone::clone);
            collected.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        assert_eq!(collected, items);
    }

    #[test]
    fn stale_cursor_restarts() {
        let items: Vec<String> = vec!["a".into(), "b".into()];
        let (page, _) = paginate(&items, Some(&encode_cursor("gone")), 10, Clone::clone);
        assert_eq!(page, items);
    }

    #[test]
    fn exact_page_boundary_has_no_next() {
        let items: Vec<String> = vec!["a".into(), "b".into()];
        let (page, next) = paginate(&items, None, 2, Clone::clone);
        assert_eq!(page.len(), 2);
        assert!(next.is_none());
    }
}
