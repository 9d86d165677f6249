//!
//! src/duplicates.rs  Andrew Belles  Oct 18th, 2025
//!
//! Reports groups of songs that look like the same track, by title, by
//! lyrics, by file content hash or by a coarse audio fingerprint. Never
//! deletes.
//!

use std::{
    collections::HashMap,
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::{Path, PathBuf}
};

use sha2::{Digest, Sha256};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::errors::ArchiverError;
use crate::types::SongRecord;

/// Only the opening of each file is decoded
pub const FINGERPRINT_SECONDS: u32 = 30;
/// Envelope resolution, windows per second
const WINDOWS_PER_SECOND: u32 = 20;
const MIN_WINDOWS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DuplicateMethod {
    Title,
    Lyrics,
    Hash,
    Fingerprint
}

impl fmt::Display for DuplicateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DuplicateMethod::Title => "title",
            DuplicateMethod::Lyrics => "lyrics",
            DuplicateMethod::Hash => "hash",
            DuplicateMethod::Fingerprint => "fingerprint"
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub method: DuplicateMethod,
    pub ids: Vec<String>,
    /// weakest link that joined the group, fingerprint groups only
    pub similarity: Option<f32>
}

/// Lowercase, trimmed, inner whitespace collapsed
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Groups of two or more keys sharing a value, in first-seen order
fn group_by_value<I>(method: DuplicateMethod, items: I) -> Vec<DuplicateGroup>
where
    I: IntoIterator<Item = (String, String)>
{
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in items {
        let ids = groups.entry(value.clone()).or_insert_with(|| {
            order.push(value);
            Vec::new()
        });
        ids.push(key);
    }
    order.into_iter()
        .filter_map(|value| groups.remove(&value))
        .filter(|ids| ids.len() > 1)
        .map(|ids| DuplicateGroup { method, ids, similarity: None })
        .collect()
}

/// Whitespace collapsed, case kept
pub fn normalize_lyrics(lyrics: &str) -> String {
    lyrics.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `keys` names each song in the report, parallel to `songs`. Empty titles
/// never group.
pub fn by_title(songs: &[SongRecord], keys: &[String]) -> Vec<DuplicateGroup> {
    group_by_value(
        DuplicateMethod::Title,
        keys.iter().zip(songs)
            .map(|(key, s)| (key.clone(), normalize_title(&s.title)))
            .filter(|(_, title)| !title.is_empty())
    )
}

/// Same lyrics text once whitespace is collapsed. Songs without lyrics are
/// left out.
pub fn by_lyrics(songs: &[SongRecord], keys: &[String]) -> Vec<DuplicateGroup> {
    group_by_value(
        DuplicateMethod::Lyrics,
        keys.iter().zip(songs)
            .map(|(key, s)| (key.clone(), normalize_lyrics(&s.lyrics)))
            .filter(|(_, lyrics)| !lyrics.is_empty())
    )
}

pub fn file_sha256(path: &Path) -> Result<String, ArchiverError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes = reader.read(&mut buffer)?;
        if bytes == 0 {
            break;
        }
        hasher.update(&buffer[..bytes]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Unreadable files are skipped with a warning
pub fn by_hash(files: &[(String, PathBuf)]) -> Vec<DuplicateGroup> {
    let hashes = files.iter().filter_map(|(key, path)| match file_sha256(path) {
        Ok(hash) => Some((key.clone(), hash)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "duplicates.hash.failed");
            None
        }
    });
    group_by_value(DuplicateMethod::Hash, hashes)
}

/// Log rms energy per short window over the opening seconds, mixed to mono
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub envelope: Vec<f32>
}

impl Fingerprint {
    pub fn from_file(path: &Path) -> Result<Self, ArchiverError> {
        let (samples, rate) = decode_mono(path, FINGERPRINT_SECONDS)?;
        let window = (rate / WINDOWS_PER_SECOND).max(1) as usize;
        let envelope = samples.chunks(window)
            .filter(|chunk| chunk.len() == window)
            .map(|chunk| {
                let mean_sq = chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32;
                (mean_sq.sqrt() + 1e-6).ln()
            })
            .collect();
        Ok( Self { envelope } )
    }

    /// Pearson correlation over the common prefix; flat or tiny envelopes
    /// compare as 0
    pub fn similarity(&self, other: &Fingerprint) -> f32 {
        let n = self.envelope.len().min(other.envelope.len());
        if n < MIN_WINDOWS {
            return 0.0;
        }
        let (a, b) = (&self.envelope[..n], &other.envelope[..n]);
        let mean_a = a.iter().sum::<f32>() / n as f32;
        let mean_b = b.iter().sum::<f32>() / n as f32;

        let (mut cov, mut var_a, mut var_b) = (0.0_f32, 0.0_f32, 0.0_f32);
        for (x, y) in a.iter().zip(b) {
            let (dx, dy) = (x - mean_a, y - mean_b);
            cov += dx * dy;
            var_a += dx * dx;
            var_b += dy * dy;
        }
        if var_a <= f32::EPSILON || var_b <= f32::EPSILON {
            return 0.0;
        }
        cov / (var_a.sqrt() * var_b.sqrt())
    }
}

fn decode_mono(path: &Path, seconds: u32) -> Result<(Vec<f32>, u32), ArchiverError> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())?;
    let mut format = probed.format;

    let track = format.default_track()
        .ok_or_else(|| ArchiverError::Audio(format!("no audio track in {}", path.display())))?;
    let track_id = track.id;
    let mut rate = track.codec_params.sample_rate;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())?;

    let mut mono: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e.into())
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(error = e, "duplicates.decode.skip");
                continue;
            },
            Err(e) => return Err(e.into())
        };

        let spec = *decoded.spec();
        let rate = *rate.get_or_insert(spec.rate);
        let channels = spec.channels.count().max(1);
        let buf = sample_buf.get_or_insert_with(|| SampleBuffer::new(decoded.capacity() as u64, spec));
        if buf.capacity() < decoded.capacity() * channels {
            *buf = SampleBuffer::new(decoded.capacity() as u64, spec);
        }
        buf.copy_interleaved_ref(decoded);
        mono.extend(buf.samples().chunks(channels).map(|f| f.iter().sum::<f32>() / channels as f32));

        if mono.len() >= (rate * seconds) as usize {
            break;
        }
    }

    let rate = rate.filter(|r| *r > 0)
        .ok_or_else(|| ArchiverError::Audio(format!("unknown sample rate for {}", path.display())))?;
    mono.truncate((rate * seconds) as usize);
    Ok((mono, rate))
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    let mut node = i;
    while parent[node] != root {
        let next = parent[node];
        parent[node] = root;
        node = next;
    }
    root
}

/// Pairs at or above `threshold` are joined transitively
pub fn by_fingerprint(files: &[(String, PathBuf)], threshold: f32) -> Vec<DuplicateGroup> {
    let prints: Vec<(String, Fingerprint)> = files.iter()
        .filter_map(|(key, path)| match Fingerprint::from_file(path) {
            Ok(fp) => Some((key.clone(), fp)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "duplicates.fingerprint.failed");
                None
            }
        })
        .collect();

    let n = prints.len();
    let mut parent: Vec<usize> = (0..n).collect();
    let mut weakest: Vec<f32> = vec![1.0; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let sim = prints[i].1.similarity(&prints[j].1);
            if sim >= threshold {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                let link = sim.min(weakest[ri]).min(weakest[rj]);
                if ri != rj {
                    parent[rj] = ri;
                }
                weakest[ri] = link;
            }
        }
    }

    let mut order: Vec<usize> = Vec::new();
    let mut members: HashMap<usize, Vec<String>> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        members.entry(root).or_insert_with(|| {
            order.push(root);
            Vec::new()
        }).push(prints[i].0.clone());
    }
    order.into_iter()
        .filter_map(|root| members.remove(&root).map(|ids| (root, ids)))
        .filter(|(_, ids)| ids.len() > 1)
        .map(|(root, ids)| DuplicateGroup {
            method: DuplicateMethod::Fingerprint,
            ids,
            similarity: Some(weakest[root])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;

    fn song(id: &str, title: &str) -> SongRecord {
        SongRecord { id: id.into(), title: title.into(), ..Default::default() }
    }

    fn keys(songs: &[SongRecord]) -> Vec<String> {
        songs.iter().map(|s| s.key()).collect()
    }

    #[test]
    fn identical_titles_form_one_group() {
        let songs = vec![song("a", "Neon Nights"), song("b", "Ocean"), song("c", "Neon Nights")];
        let groups = by_title(&songs, &keys(&songs));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec!["a", "c"]);
        assert_eq!(groups[0].method, DuplicateMethod::Title);
    }

    #[test]
    fn distinct_titles_form_no_groups() {
        let songs = vec![song("a", "Neon Nights"), song("b", "Ocean"), song("c", ""), song("d", "  ")];
        assert!(by_title(&songs, &keys(&songs)).is_empty());
    }

    #[test]
    fn titles_are_normalized() {
        assert_eq!(normalize_title("  Neon   NIGHTS\t"), "neon nights");
        let songs = vec![song("a", "Neon Nights"), song("b", " neon  nights ")];
        assert_eq!(by_title(&songs, &keys(&songs)).len(), 1);
    }

    #[test]
    fn groups_use_the_given_keys() {
        let songs = vec![song("a", "Neon Nights"), song("a", "Neon Nights")];
        let planned = vec!["a".to_string(), "a#2".to_string()];
        assert_eq!(by_title(&songs, &planned)[0].ids, vec!["a", "a#2"]);
    }

    #[test]
    fn identical_lyrics_group_regardless_of_spacing() {
        let mut songs = vec![
            song("a", "First Take"),
            song("b", "Second Take"),
            song("c", "Other"),
            song("d", "Instrumental"),
            song("e", "Also Instrumental"),
        ];
        songs[0].lyrics = "[Verse]\nneon glow\n\nin the rain".into();
        songs[1].lyrics = "  [Verse] neon glow   in the rain\n".into();
        songs[2].lyrics = "[Verse]\nNeon glow in the rain".into();
        songs[4].lyrics = " \n\t ".into();

        let groups = by_lyrics(&songs, &keys(&songs));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].method, DuplicateMethod::Lyrics);
        assert_eq!(groups[0].ids, vec!["a", "b"]);
        assert_eq!(normalize_lyrics(" a \n b "), "a b");
    }

    #[test]
    fn identical_bytes_share_a_hash_group() {
        let dir = tempfile::tempdir().unwrap();
        let write = |name: &str, bytes: &[u8]| {
            let p = dir.path().join(name);
            std::fs::write(&p, bytes).unwrap();
            p
        };
        let files = vec![
            ("a".to_string(), write("a.mp3", b"same bytes")),
            ("b".to_string(), write("b.mp3", b"other bytes")),
            ("c".to_string(), write("c.mp3", b"same bytes")),
            ("d".to_string(), dir.path().join("missing.mp3")),
        ];
        let groups = by_hash(&files);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec!["a", "c"]);
        let digest = file_sha256(&files[0].1).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, file_sha256(&files[2].1).unwrap());
    }

    /// Amplitude-modulated tone; `phase` shifts the loudness curve
    fn tone(path: &Path, gain: f32, phase: f32) {
        let rate = 8000;
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..(rate * 4) {
            let t = i as f32 / rate as f32;
            let envelope = 0.3 + 0.25 * (1.0 + (2.0 * PI * 0.5 * t + phase).sin());
            let sample = gain * envelope * (2.0 * PI * 440.0 * t).sin();
            writer.write_sample((sample * i16::MAX as f32 * 0.9) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn fingerprints_group_rescaled_copies_only() {
        let dir = tempfile::tempdir().unwrap();
        let (a, b, c) = (dir.path().join("a.wav"), dir.path().join("b.wav"), dir.path().join("c.wav"));
        tone(&a, 1.0, 0.0);
        tone(&b, 0.6, 0.0);
        tone(&c, 1.0, PI);

        let fa = Fingerprint::from_file(&a).unwrap();
        let fc = Fingerprint::from_file(&c).unwrap();
        assert!(fa.envelope.len() >= 70);
        assert!(fa.similarity(&fc) < 0.0);

        let files = vec![("a".to_string(), a), ("b".to_string(), b), ("c".to_string(), c)];
        let groups = by_fingerprint(&files, 0.9);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ids, vec!["a", "b"]);
        assert!(groups[0].similarity.unwrap() >= 0.9);
    }

    #[test]
    fn flat_envelopes_never_match() {
        let flat = Fingerprint { envelope: vec![1.0; 50] };
        assert_eq!(flat.similarity(&flat.clone()), 0.0);
        let short = Fingerprint { envelope: vec![1.0, 2.0] };
        assert_eq!(short.similarity(&short.clone()), 0.0);
    }
}
