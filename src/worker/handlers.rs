//! Task handlers executed inside the worker process.
//!
//! The dispatch core only cares that a handler either returns a value or an
//! error; the implementations here are the stock ones wired into
//! `medley-workerd`. They are deliberately tolerant: feeds in the wild are
//! malformed and media files lie about their containers.
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use once_cell::sync::Lazy;
use regex::Regex;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{MetadataOptions, MetadataRevision, StandardTagKey};
use symphonia::core::probe::Hint;
use url::Url;

use crate::protocol::{FeedEntry, ParsedFeed, ProbeReport, TagBundle};

/// The jobs a worker process knows how to run. One implementation per
/// deployment; tests substitute instrumented ones.
pub trait TaskHandlers: Send + Sync {
    /// Parse raw feed bytes into a structured feed.
    fn feed_parse(&self, html: &[u8]) -> anyhow::Result<ParsedFeed>;
    /// Read tags and embedded cover art from an audio file.
    fn tag_extract(&self, source_path: &Path, cover_art_dir: &Path) -> anyhow::Result<TagBundle>;
    /// Probe a media file for duration and stream layout. Only ever invoked
    /// on the worker process's main thread.
    fn media_probe(&self, source_path: &Path, screenshot_dir: &Path) -> anyhow::Result<ProbeReport>;
}

/// Production handlers used by the `medley-workerd` binary.
#[derive(Debug, Default)]
pub struct StockHandlers;

static XML_ENCODING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)encoding="([A-Za-z0-9._\-]+)""#).unwrap());
static ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<(?:item|entry)\b[^>]*>(.*?)</(?:item|entry)>").unwrap());
static TITLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static ENCLOSURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<enclosure[^>]*?url="([^"]+)""#).unwrap());
static LINK_HREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<link[^>]*?href="([^"]+)""#).unwrap());
static LINK_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<link[^>]*>([^<]+)</link>").unwrap());
static CDATA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<!\[CDATA\[(.*?)\]\]>").unwrap());

/// Decode feed bytes, honoring a BOM or an XML declaration charset, falling
/// back to lossy UTF-8.
fn decode_feed(html: &[u8]) -> String {
    if let Some((encoding, bom_len)) = encoding_rs::Encoding::for_bom(html) {
        let (text, _) = encoding.decode_without_bom_handling(&html[bom_len..]);
        return text.into_owned();
    }
    let head = &html[..html.len().min(256)];
    if let Some(caps) = XML_ENCODING_RE.captures(&String::from_utf8_lossy(head)) {
        if let Some(encoding) = encoding_rs::Encoding::for_label(caps[1].as_bytes()) {
            let (text, _) = encoding.decode_without_bom_handling(html);
            return text.into_owned();
        }
    }
    String::from_utf8_lossy(html).into_owned()
}

fn clean_text(raw: &str) -> Option<String> {
    let unwrapped = CDATA_RE.replace_all(raw, "$1");
    let text = unwrapped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .trim()
        .to_string();
    if text.is_empty() { None } else { Some(text) }
}

/// First URL-shaped candidate out of enclosure, atom link, or RSS link text.
fn entry_url(block: &str) -> Option<String> {
    let candidates = ENCLOSURE_RE
        .captures(block)
        .or_else(|| LINK_HREF_RE.captures(block))
        .map(|caps| caps[1].to_string())
        .into_iter()
        .chain(
            LINK_TEXT_RE
                .captures(block)
                .and_then(|caps| clean_text(&caps[1])),
        );
    for candidate in candidates {
        if let Ok(url) = Url::parse(&candidate) {
            return Some(url.into());
        }
    }
    None
}

impl TaskHandlers for StockHandlers {
    fn feed_parse(&self, html: &[u8]) -> anyhow::Result<ParsedFeed> {
        if html.is_empty() {
            bail!("empty feed document");
        }
        let text = decode_feed(html);

        let title = TITLE_RE
            .captures(&text)
            .and_then(|caps| clean_text(&caps[1]));
        let entries = ITEM_RE
            .captures_iter(&text)
            .map(|item| {
                let block = &item[1];
                FeedEntry {
                    title: TITLE_RE
                        .captures(block)
                        .and_then(|caps| clean_text(&caps[1])),
                    url: entry_url(block),
                }
            })
            .collect();

        Ok(ParsedFeed { title, entries })
    }

    fn tag_extract(&self, source_path: &Path, cover_art_dir: &Path) -> anyhow::Result<TagBundle> {
        let mut opened = open_media(source_path)?;
        let mut bundle = TagBundle {
            duration_secs: opened.duration_secs(),
            ..TagBundle::default()
        };

        let mut cover: Option<(String, Box<[u8]>)> = None;
        opened.visit_metadata(|rev| {
            for tag in rev.tags() {
                let value = tag.value.to_string();
                match tag.std_key {
                    Some(StandardTagKey::TrackTitle) => bundle.title.get_or_insert(value),
                    Some(StandardTagKey::Artist) => bundle.artist.get_or_insert(value),
                    Some(StandardTagKey::Album) => bundle.album.get_or_insert(value),
                    _ => continue,
                };
            }
            if cover.is_none() {
                if let Some(visual) = rev.visuals().first() {
                    cover = Some((visual.media_type.clone(), visual.data.clone()));
                }
            }
        });

        if let Some((media_type, data)) = cover {
            bundle.cover_art = Some(write_cover_art(
                source_path,
                cover_art_dir,
                &media_type,
                &data,
            )?);
        }
        Ok(bundle)
    }

    fn media_probe(&self, source_path: &Path, _screenshot_dir: &Path) -> anyhow::Result<ProbeReport> {
        let opened = open_media(source_path)?;
        // Frame rendering for screenshots lives in the GUI renderer; the
        // probe reports stream layout only.
        Ok(ProbeReport {
            duration_secs: opened.duration_secs(),
            track_count: opened.format.tracks().len(),
            sample_rate: opened
                .format
                .default_track()
                .and_then(|t| t.codec_params.sample_rate),
            screenshot: None,
        })
    }
}

struct OpenedMedia {
    format: Box<dyn symphonia::core::formats::FormatReader>,
    probe_metadata: symphonia::core::probe::ProbedMetadata,
}

impl OpenedMedia {
    fn duration_secs(&self) -> Option<f64> {
        let params = &self.format.default_track()?.codec_params;
        let time_base = params.time_base?;
        let frames = params.n_frames?;
        let time = time_base.calc_time(frames);
        Some(time.seconds as f64 + time.frac)
    }

    /// Apply `visit` to the container metadata and to any metadata collected
    /// while probing (e.g. ID3v2 ahead of the container).
    fn visit_metadata(&mut self, mut visit: impl FnMut(&MetadataRevision)) {
        let mut container = self.format.metadata();
        if let Some(rev) = container.skip_to_latest() {
            visit(rev);
        }
        drop(container);
        if let Some(mut probed) = self.probe_metadata.get() {
            if let Some(rev) = probed.skip_to_latest() {
                visit(rev);
            }
        }
    }
}

fn open_media(source_path: &Path) -> anyhow::Result<OpenedMedia> {
    let file = fs::File::open(source_path)
        .with_context(|| format!("cannot open media file {}", source_path.display()))?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = source_path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("unrecognized media format {}", source_path.display()))?;

    Ok(OpenedMedia {
        format: probed.format,
        probe_metadata: probed.metadata,
    })
}

fn write_cover_art(
    source_path: &Path,
    cover_art_dir: &Path,
    media_type: &str,
    data: &[u8],
) -> anyhow::Result<PathBuf> {
    let extension = match media_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        _ => "img",
    };
    let stem = source_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("cover");
    fs::create_dir_all(cover_art_dir)
        .with_context(|| format!("cannot create {}", cover_art_dir.display()))?;
    let target = cover_art_dir.join(format!("{}.{}", stem, extension));
    fs::write(&target, data).with_context(|| format!("cannot write {}", target.display()))?;
    Ok(target)
}
