//! Paragraph-boundary passage splitter.
//!
//! Splits each page's text into [`Passage`]s that respect a configurable
//! character limit. Splitting occurs on paragraph boundaries (`\n\n`) so a
//! quoted snippet stays coherent, with a hard split for oversized paragraphs.
//!
//! Passage indices restart at 0 on each page; together with the 1-based page
//! they form the citation locator (`p{page}#{index}`).

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::Locator;

/// A splitter-produced unit of retrievable text.
#[derive(Debug, Clone)]
pub struct Passage {
    pub id: String,
    pub locator: Locator,
    pub text: String,
    pub hash: String,
}

/// Split a document's pages into passages. Pages are numbered from 1 in the
/// order given; empty pages produce no passages.
pub fn split_pages(pages: &[String], max_chars: usize) -> Vec<Passage> {
    let mut out = Vec::new();
    for (page_idx, page) in pages.iter().enumerate() {
        let page_no = page_idx as i64 + 1;
        for (i, text) in split_page(page, max_chars).into_iter().enumerate() {
            out.push(make_passage(Locator::new(page_no, i as i64), &text));
        }
    }
    out
}

fn split_page(text: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !buf.is_empty() {
            pieces.push(std::mem::take(&mut buf));
        }

        if trimmed.len() > max_chars {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
            }
            // Hard split oversized paragraphs at the nearest space/newline
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let limit = floor_char_boundary(remaining, max_chars.min(remaining.len()));
                let split_at = if limit < remaining.len() {
                    remaining[..limit]
                        .rfind('\n')
                        .or_else(|| remaining[..limit].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(limit)
                } else {
                    limit
                };
                pieces.push(remaining[..split_at].trim().to_string());
                remaining = &remaining[split_at..];
            }
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(trimmed);
        }
    }

    if !buf.is_empty() {
        pieces.push(buf);
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}

fn make_passage(locator: Locator, text: &str) -> Passage {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Passage {
        id: Uuid::new_v4().to_string(),
        locator,
        text: text.to_string(),
        hash,
    }
}
