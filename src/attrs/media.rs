//! Media attributes (types 8 and 9).
//!
//! Video/audio metadata rides in the `fa` string as two 8-byte payloads
//! XXTEA-encrypted under the tail of the file key. Attribute 8 packs
//! width/height/fps/playtime/shortformat with escape encodings for
//! out-of-range values; attribute 9 carries the container and codec ids
//! when `shortformat == 0`.
//!
//! Endianness is load-bearing here: the file key becomes a `u32[8]` in
//! **big-endian** word order (the XXTEA key is words 4..8), while the
//! 8-byte payloads are split into two **little-endian** `u32` words.

use std::collections::HashMap;

use serde_json::Value;

use crate::base64::{base64url_decode, base64url_encode};
use crate::crypto::xxtea::{xxtea_decrypt, xxtea_encrypt};

/// Media information for video/audio files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// Video width in pixels.
    pub width: u32,
    /// Video height in pixels.
    pub height: u32,
    /// Frames per second.
    pub fps: u32,
    /// Duration in seconds.
    pub playtime: u32,
    /// Compact format code: 0 = custom (see attribute 9), 255 = unknown.
    pub shortformat: u8,
    /// Container id (attribute 9).
    pub container: u16,
    /// Video codec id (attribute 9).
    pub videocodec: u16,
    /// Audio codec id (attribute 9).
    pub audiocodec: u16,
}

impl MediaInfo {
    /// Whether the format was recognized at probe time.
    pub fn is_valid(&self) -> bool {
        self.shortformat != 255
    }

    pub fn is_video(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn is_audio(&self) -> bool {
        self.playtime > 0 && !self.is_video()
    }

    /// `WxH` string, empty for audio-only media.
    pub fn resolution(&self) -> String {
        if self.width > 0 && self.height > 0 {
            format!("{}x{}", self.width, self.height)
        } else {
            String::new()
        }
    }

    /// `H:MM:SS` or `M:SS` formatted playtime.
    pub fn duration_formatted(&self) -> String {
        let hours = self.playtime / 3600;
        let minutes = (self.playtime % 3600) / 60;
        let seconds = self.playtime % 60;
        if hours > 0 {
            format!("{}:{:02}:{:02}", hours, minutes, seconds)
        } else {
            format!("{}:{:02}", minutes, seconds)
        }
    }
}

/// Derive the XXTEA key: big-endian words 4..8 of the 32-byte file key.
fn xxkey(file_key: &[u8; 32]) -> [u32; 4] {
    let mut k = [0u32; 4];
    for (i, item) in k.iter_mut().enumerate() {
        let off = 16 + i * 4;
        *item = u32::from_be_bytes([
            file_key[off],
            file_key[off + 1],
            file_key[off + 2],
            file_key[off + 3],
        ]);
    }
    k
}

fn payload_to_words(payload: &[u8; 8]) -> [u32; 2] {
    [
        u32::from_le_bytes(payload[..4].try_into().unwrap()),
        u32::from_le_bytes(payload[4..].try_into().unwrap()),
    ]
}

fn words_to_payload(words: &[u32; 2]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&words[0].to_le_bytes());
    out[4..].copy_from_slice(&words[1].to_le_bytes());
    out
}

fn encrypt_payload(payload: &[u8; 8], file_key: &[u8; 32]) -> [u8; 8] {
    let mut words = payload_to_words(payload);
    xxtea_encrypt(&mut words, &xxkey(file_key));
    words_to_payload(&words)
}

fn decrypt_payload(payload: &[u8; 8], file_key: &[u8; 32]) -> [u8; 8] {
    let mut words = payload_to_words(payload);
    xxtea_decrypt(&mut words, &xxkey(file_key));
    words_to_payload(&words)
}

/// Pack attribute 8. Width/height/fps/playtime are doubled, with the low
/// bit flagging the escaped (divided) form when a value overflows its field.
fn encode_attr8(info: &MediaInfo) -> [u8; 8] {
    let mut width = info.width << 1;
    if width >= 32768 {
        width = ((width - 32768) >> 3) | 1;
    }
    if width >= 32768 {
        width = 32767;
    }

    let mut height = info.height << 1;
    if height >= 32768 {
        height = ((height - 32768) >> 3) | 1;
    }
    if height >= 32768 {
        height = 32767;
    }

    let mut playtime = info.playtime << 1;
    if playtime >= 262144 {
        playtime = ((playtime - 262200) / 60) | 1;
    }
    if playtime >= 262144 {
        playtime = 262143;
    }

    let mut fps = info.fps << 1;
    if fps >= 256 {
        fps = ((fps - 256) >> 3) | 1;
    }
    if fps >= 256 {
        fps = 255;
    }

    let mut v = [0u8; 8];
    v[7] = info.shortformat;
    v[6] = ((playtime >> 10) & 0xFF) as u8;
    v[5] = ((playtime >> 2) & 0xFF) as u8;
    v[4] = (((playtime & 3) << 6) + (fps >> 2)) as u8;
    v[3] = (((fps & 3) << 6) + ((height >> 9) & 63)) as u8;
    v[2] = ((height >> 1) & 0xFF) as u8;
    v[1] = (((width >> 8) & 127) + ((height & 1) << 7)) as u8;
    v[0] = (width & 0xFF) as u8;
    v
}

fn parse_attr8(v: &[u8; 8]) -> MediaInfo {
    let b = v.map(|x| x as u32);

    let mut width = (b[0] >> 1) + ((b[1] & 127) << 7);
    if b[0] & 1 != 0 {
        width = (width << 3) + 16384;
    }

    let mut height = b[2] + ((b[3] & 63) << 8);
    if b[1] & 128 != 0 {
        height = (height << 1) + 16384;
    }

    let mut fps = (b[3] >> 7) + ((b[4] & 63) << 1);
    if b[3] & 64 != 0 {
        fps = (fps << 3) + 128;
    }

    let mut playtime = (b[4] >> 7) + (b[5] << 1) + (b[6] << 9);
    if b[4] & 64 != 0 {
        playtime = playtime * 60 + 131100;
    }

    MediaInfo {
        width,
        height,
        fps,
        playtime,
        shortformat: v[7],
        ..Default::default()
    }
}

/// Pack attribute 9: container id (u8), video codec (u12), audio codec
/// (u12), little-endian across bytes 0..4.
fn encode_attr9(info: &MediaInfo) -> [u8; 8] {
    let mut v = [0u8; 8];
    v[3] = ((info.audiocodec >> 4) & 0xFF) as u8;
    v[2] = (((info.videocodec >> 8) & 15) + ((info.audiocodec & 15) << 4)) as u8;
    v[1] = (info.videocodec & 0xFF) as u8;
    v[0] = (info.container & 0xFF) as u8;
    v
}

fn parse_attr9(v: &[u8; 8], info: &mut MediaInfo) {
    let b = v.map(|x| x as u16);
    info.container = b[0];
    info.videocodec = b[1] + ((b[2] & 15) << 8);
    info.audiocodec = (b[2] >> 4) + (b[3] << 4);
}

/// Encode media info into the `fa` fragment: `8*<b64>` plus `/9*<b64>`
/// when the codec triple is present.
pub fn encode_media_attributes(info: &MediaInfo, file_key: &[u8; 32]) -> String {
    let enc8 = encrypt_payload(&encode_attr8(info), file_key);
    let mut out = format!("8*{}", base64url_encode(&enc8));

    if info.shortformat == 0
        && (info.container != 0 || info.videocodec != 0 || info.audiocodec != 0)
    {
        let enc9 = encrypt_payload(&encode_attr9(info), file_key);
        out.push_str(&format!("/9*{}", base64url_encode(&enc9)));
    }

    out
}

/// Decode media info from a node's `fa` string, if it carries attribute 8.
pub fn decode_media_attributes(fa: &str, file_key: &[u8; 32]) -> Option<MediaInfo> {
    let attr8 = fa_fragment(fa, 8)?;
    let data = base64url_decode(attr8).ok()?;
    let payload: [u8; 8] = data.get(..8)?.try_into().ok()?;

    let mut info = parse_attr8(&decrypt_payload(&payload, file_key));

    if info.shortformat == 0 {
        if let Some(attr9) = fa_fragment(fa, 9) {
            if let Ok(data9) = base64url_decode(attr9) {
                if let Ok(payload9) = <[u8; 8]>::try_from(&data9[..8.min(data9.len())]) {
                    parse_attr9(&decrypt_payload(&payload9, file_key), &mut info);
                }
            }
        }
    }

    Some(info)
}

/// Extract the payload for one attribute type from an `fa` string.
///
/// Fragments look like `type*handle` joined by `/`, optionally prefixed
/// with a numeric owner id and `:`.
pub fn fa_fragment(fa: &str, attr_type: u32) -> Option<&str> {
    for part in fa.split('/') {
        let type_handle = match part.split_once(':') {
            Some((_, rest)) => rest,
            None => part,
        };
        if let Some((t, handle)) = type_handle.split_once('*') {
            if t.parse::<u32>() == Ok(attr_type) {
                return Some(handle);
            }
        }
    }
    None
}

/// Container/codec id lookup tables, seedable from the `mc` command.
#[derive(Debug, Clone)]
pub struct CodecTables {
    containers: HashMap<u16, String>,
    video: HashMap<u16, String>,
    audio: HashMap<u16, String>,
    /// shortformat id -> (container, video codec, audio codec)
    shortformats: HashMap<u8, (String, String, String)>,
}

impl Default for CodecTables {
    fn default() -> Self {
        let containers = [
            (129u16, "mp4"),
            (130, "webm"),
            (131, "mkv"),
            (132, "avi"),
            (133, "mov"),
            (134, "flv"),
            (135, "m4v"),
        ];
        let video = [
            (887u16, "avc1"),
            (888, "hevc"),
            (889, "vp8"),
            (890, "vp9"),
            (891, "av1"),
        ];
        let audio = [
            (1u16, "mp4a-40-2"),
            (2, "mp3"),
            (3, "opus"),
            (4, "vorbis"),
            (5, "flac"),
        ];
        let shortformats = [
            (1u8, ("mp4", "avc1", "mp4a-40-2")),
            (2, ("mp4", "avc1", "")),
            (3, ("mp4", "", "mp4a-40-2")),
        ];

        Self {
            containers: containers
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
            video: video.into_iter().map(|(k, v)| (k, v.to_string())).collect(),
            audio: audio.into_iter().map(|(k, v)| (k, v.to_string())).collect(),
            shortformats: shortformats
                .into_iter()
                .map(|(k, (c, v, a))| (k, (c.to_string(), v.to_string(), a.to_string())))
                .collect(),
        }
    }
}

impl CodecTables {
    /// Merge `[id, name]` pair lists from an `mc` response into the tables.
    /// Unknown shapes are ignored; built-in entries survive.
    pub fn merge_mc_response(&mut self, response: &Value) {
        let Some(parts) = response.as_array() else {
            return;
        };

        let tables = [
            &mut self.containers as &mut HashMap<u16, String>,
            &mut self.video,
            &mut self.audio,
        ];
        let mut iter = parts.iter().filter(|p| p.is_array());
        for table in tables {
            let Some(list) = iter.next().and_then(|p| p.as_array()) else {
                return;
            };
            for entry in list {
                if let (Some(id), Some(name)) = (
                    entry.get(0).and_then(|v| v.as_u64()),
                    entry.get(1).and_then(|v| v.as_str()),
                ) {
                    table.insert(id as u16, name.to_string());
                }
            }
        }
    }

    /// Resolve the container name for a decoded [`MediaInfo`].
    pub fn container_name(&self, info: &MediaInfo) -> Option<&str> {
        if let Some((c, _, _)) = self.shortformats.get(&info.shortformat) {
            return Some(c);
        }
        self.containers.get(&info.container).map(|s| s.as_str())
    }

    /// Resolve the video codec name for a decoded [`MediaInfo`].
    pub fn video_codec_name(&self, info: &MediaInfo) -> Option<&str> {
        if let Some((_, v, _)) = self.shortformats.get(&info.shortformat) {
            return Some(v).filter(|s| !s.is_empty()).map(|x| x.as_str());
        }
        self.video.get(&info.videocodec).map(|s| s.as_str())
    }

    /// Resolve the audio codec name for a decoded [`MediaInfo`].
    pub fn audio_codec_name(&self, info: &MediaInfo) -> Option<&str> {
        if let Some((_, _, a)) = self.shortformats.get(&info.shortformat) {
            return Some(a).filter(|s| !s.is_empty()).map(|x| x.as_str());
        }
        self.audio.get(&info.audiocodec).map(|s| s.as_str())
    }
}
