//! RouterOS binary API wire format.
//!
//! A sentence is a sequence of length-prefixed words terminated by an empty
//! word. Lengths use a 1 to 5 byte prefix:
//!
//! | length            | encoding                     |
//! |-------------------|------------------------------|
//! | `< 0x80`          | 1 byte                       |
//! | `< 0x4000`        | 2 bytes, OR `0x8000`         |
//! | `< 0x200000`      | 3 bytes, OR `0xC00000`       |
//! | `< 0x10000000`    | 4 bytes, OR `0xE0000000`     |
//! | otherwise         | `0xF0` followed by 4 bytes   |

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::{ProtocolError, Row};

/// Largest word accepted from the wire.
const MAX_WORD_LEN: usize = 16 * 1024 * 1024;

/// Append the length prefix for a word of `len` bytes.
pub fn encode_length(len: usize, out: &mut Vec<u8>) {
    let len = len as u32;
    if len < 0x80 {
        out.push(len as u8);
    } else if len < 0x4000 {
        out.extend_from_slice(&(len | 0x8000).to_be_bytes()[2..]);
    } else if len < 0x20_0000 {
        out.extend_from_slice(&(len | 0xC0_0000).to_be_bytes()[1..]);
    } else if len < 0x1000_0000 {
        out.extend_from_slice(&(len | 0xE000_0000).to_be_bytes());
    } else {
        out.push(0xF0);
        out.extend_from_slice(&len.to_be_bytes());
    }
}

/// Encode a full sentence including the terminating empty word.
pub fn encode_sentence<S: AsRef<str>>(words: &[S]) -> Vec<u8> {
    let mut out = Vec::new();
    for word in words {
        let bytes = word.as_ref().as_bytes();
        encode_length(bytes.len(), &mut out);
        out.extend_from_slice(bytes);
    }
    out.push(0);
    out
}

/// Read one length prefix.
pub async fn read_length<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize, ProtocolError> {
    let b0 = r.read_u8().await?;
    let (extra, first) = match b0 {
        b if b & 0x80 == 0 => (0, u32::from(b)),
        b if b & 0xC0 == 0x80 => (1, u32::from(b & 0x3F)),
        b if b & 0xE0 == 0xC0 => (2, u32::from(b & 0x1F)),
        b if b & 0xF0 == 0xE0 => (3, u32::from(b & 0x0F)),
        0xF0 => (4, 0),
        b => return Err(ProtocolError::Decode(format!("invalid length prefix 0x{b:02x}"))),
    };

    let mut len = first;
    for _ in 0..extra {
        len = (len << 8) | u32::from(r.read_u8().await?);
    }
    Ok(len as usize)
}

/// Read one word. Non-UTF-8 bytes are replaced.
pub async fn read_word<R: AsyncRead + Unpin>(r: &mut R) -> Result<String, ProtocolError> {
    let len = read_length(r).await?;
    if len > MAX_WORD_LEN {
        return Err(ProtocolError::Decode(format!("word of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Read words up to (not including) the terminating empty word.
pub async fn read_sentence<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<String>, ProtocolError> {
    let mut words = Vec::new();
    loop {
        let word = read_word(r).await?;
        if word.is_empty() {
            return Ok(words);
        }
        words.push(word);
    }
}

/// A decoded reply sentence.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Re(Row),
    Done(Row),
    Trap(Row),
    Fatal(String),
}

/// Split `=key=value` into its parts. Keys may themselves start with a dot
/// (`=.id=*1`).
fn parse_attribute(word: &str) -> Option<(String, String)> {
    let rest = word.strip_prefix('=')?;
    let (key, value) = rest.split_once('=').unwrap_or((rest, ""));
    Some((key.to_string(), value.to_string()))
}

/// Decode a reply sentence read with [`read_sentence`].
pub fn parse_reply(words: Vec<String>) -> Result<Reply, ProtocolError> {
    let mut iter = words.into_iter();
    let Some(kind) = iter.next() else {
        return Err(ProtocolError::Decode("empty sentence".to_string()));
    };

    if kind == "!fatal" {
        let message: Vec<String> = iter.collect();
        return Ok(Reply::Fatal(message.join(" ")));
    }

    let row: Row = iter.filter_map(|w| parse_attribute(&w)).collect();
    match kind.as_str() {
        "!re" => Ok(Reply::Re(row)),
        "!done" => Ok(Reply::Done(row)),
        "!trap" => Ok(Reply::Trap(row)),
        other => Err(ProtocolError::Decode(format!("unexpected reply word '{other}'"))),
    }
}

/// Build the words of a command sentence.
///
/// Parameters become `=key=value` attributes. Keys starting with `?` are
/// passed through as query words (`?type=ether`).
pub fn command_words(path: &str, params: &[(&str, &str)]) -> Vec<String> {
    let mut words = Vec::with_capacity(params.len() + 1);
    words.push(path.to_string());
    for (key, value) in params {
        if key.starts_with('?') {
            words.push(format!("{key}={value}"));
        } else {
            words.push(format!("={key}={value}"));
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn encoded_len(len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        encode_length(len, &mut out);
        out
    }

    #[test]
    fn test_length_prefix_boundaries() {
        assert_eq!(encoded_len(0x00), vec![0x00]);
        assert_eq!(encoded_len(0x7F), vec![0x7F]);
        assert_eq!(encoded_len(0x80), vec![0x80, 0x80]);
        assert_eq!(encoded_len(0x3FFF), vec![0xBF, 0xFF]);
        assert_eq!(encoded_len(0x4000), vec![0xC0, 0x40, 0x00]);
        assert_eq!(encoded_len(0x1F_FFFF), vec![0xDF, 0xFF, 0xFF]);
        assert_eq!(encoded_len(0x20_0000), vec![0xE0, 0x20, 0x00, 0x00]);
        assert_eq!(encoded_len(0x0FFF_FFFF), vec![0xEF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(encoded_len(0x1000_0000), vec![0xF0, 0x10, 0x00, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn test_length_decode_matches_encode() {
        for len in [0usize, 1, 0x7F, 0x80, 0x3FFF, 0x4000, 0x1F_FFFF, 0x20_0000, 0x0FFF_FFFF] {
            let bytes = encoded_len(len);
            let mut reader = bytes.as_slice();
            assert_eq!(read_length(&mut reader).await.unwrap(), len, "len {len:#x}");
        }
    }

    #[tokio::test]
    async fn test_invalid_prefix() {
        let mut reader: &[u8] = &[0xF8];
        assert!(matches!(
            read_length(&mut reader).await,
            Err(ProtocolError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_sentence_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let long = "x".repeat(200);
        let words = vec!["!re".to_string(), "=name=ether1".to_string(), format!("=comment={long}")];
        server.write_all(&encode_sentence(&words)).await.unwrap();

        let read = read_sentence(&mut client).await.unwrap();
        assert_eq!(read, words);
    }

    #[test]
    fn test_parse_reply_kinds() {
        let re = parse_reply(vec![
            "!re".into(),
            "=.id=*1".into(),
            "=name=ether1".into(),
            "=comment=a=b".into(),
            ".tag=3".into(),
        ])
        .unwrap();
        let Reply::Re(row) = re else {
            panic!("expected !re");
        };
        assert_eq!(row.get(".id").map(String::as_str), Some("*1"));
        assert_eq!(row.get("comment").map(String::as_str), Some("a=b"));
        assert!(!row.contains_key(".tag"));

        let trap = parse_reply(vec!["!trap".into(), "=message=no such command".into()]).unwrap();
        assert!(matches!(trap, Reply::Trap(r) if r["message"] == "no such command"));

        let fatal = parse_reply(vec!["!fatal".into(), "session terminated on request".into()]).unwrap();
        assert_eq!(fatal, Reply::Fatal("session terminated on request".into()));

        assert!(parse_reply(vec!["!bogus".into()]).is_err());
        assert!(parse_reply(Vec::new()).is_err());
    }

    #[test]
    fn test_command_words() {
        let words = command_words("/ping", &[("address", "8.8.8.8"), ("count", "1")]);
        assert_eq!(words, vec!["/ping", "=address=8.8.8.8", "=count=1"]);

        let words = command_words("/interface/print", &[("?type", "ether")]);
        assert_eq!(words, vec!["/interface/print", "?type=ether"]);
    }
}
