// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Display names made safe for archive entries and response headers.

use std::fmt::Write;

use unicode_normalization::UnicodeNormalization;

/// Used when nothing printable is left of a name.
pub const FALLBACK_FILENAME: &str = "download";

/// Upper bound of a sanitized name, in bytes.
pub const MAX_FILENAME_BYTES: usize = 180;

const MAX_EXTENSION_BYTES: usize = 16;

/// Path separators and characters that break quoting in headers or are
/// reserved on common filesystems.
const REPLACED: &[char] = &['/', '\\', '"', '\'', ':', '*', '?', '<', '>', '|', ';'];

/// Bidirectional overrides can disguise an extension (`evil\u{202E}lts.exe`).
const fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

/// Normalizes `name` to NFC and turns it into a single flat file name.
///
/// The result contains no control characters, no path separators and no
/// quotes, never starts with a dot and is at most [`MAX_FILENAME_BYTES`]
/// long, keeping a short extension intact when it has to be cut.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .nfc()
        .filter(|c| !c.is_control() && !is_bidi_control(*c))
        .map(|c| if REPLACED.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = cleaned
        .trim_matches(|c: char| c.is_whitespace())
        .trim_start_matches('.')
        .trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        return FALLBACK_FILENAME.to_string();
    }
    truncate_keeping_extension(trimmed, MAX_FILENAME_BYTES)
}

fn truncate_keeping_extension(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let extension = name
        .rfind('.')
        .map(|dot| &name[dot..])
        .filter(|ext| ext.len() > 1 && ext.len() <= MAX_EXTENSION_BYTES)
        .unwrap_or("");
    let stem = &name[..name.len() - extension.len()];
    let mut cut = max - extension.len();
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{extension}", &stem[..cut])
}

/// Inserts ` (n)` before the extension: `part.stl` becomes `part (2).stl`.
///
/// The stem is shortened when needed so that the result stays within
/// [`MAX_FILENAME_BYTES`].
#[must_use]
pub fn numbered(name: &str, n: usize) -> String {
    let (stem, extension) = match name
        .rfind('.')
        .filter(|&dot| dot > 0 && name.len() - dot <= MAX_EXTENSION_BYTES)
    {
        Some(dot) => name.split_at(dot),
        None => (name, ""),
    };
    let suffix = format!(" ({n}){extension}");
    let mut cut = stem.len().min(MAX_FILENAME_BYTES.saturating_sub(suffix.len()));
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{suffix}", &stem[..cut])
}

/// Percent-encodes every byte for which `keep` is false.
pub fn percent_encode(input: &str, keep: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if keep(byte) {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// RFC 6266 `attachment` disposition with an ASCII fallback and the RFC 5987
/// UTF-8 form.
#[must_use]
pub fn content_disposition(display_name: &str) -> String {
    let name = sanitize_filename(display_name);
    let ascii: String = name
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    let encoded = percent_encode(&name, |b| {
        b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b)
    });
    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

/// Media type by file extension.
#[must_use]
pub fn content_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "stl" => "model/stl",
        "3mf" => "model/3mf",
        "obj" => "model/obj",
        "gltf" => "model/gltf+json",
        "glb" => "model/gltf-binary",
        "step" | "stp" => "model/step",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "json" => "application/json",
        "txt" | "md" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
