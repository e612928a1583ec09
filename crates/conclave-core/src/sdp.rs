//! Session description rewriting.
//!
//! The media engine assigns volatile mids ("0", "1", ...) to its media lines.
//! Before an offer leaves the client, tracked lines are renamed to stable,
//! protocol-visible ids so the remote node and later renegotiations agree on
//! which line carries which role. The same pass collects the ICE credentials
//! needed to complete trickled candidates.

use std::collections::BTreeMap;

/// Logical role of a media line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StableMediaId {
    MainAudio,
    MainVideo,
    PresentationVideo,
}

impl StableMediaId {
    pub const ALL: [StableMediaId; 3] = [
        StableMediaId::MainAudio,
        StableMediaId::MainVideo,
        StableMediaId::PresentationVideo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StableMediaId::MainAudio => "main-audio",
            StableMediaId::MainVideo => "main-video",
            StableMediaId::PresentationVideo => "presentation-video",
        }
    }

    fn content(&self) -> &'static str {
        match self {
            StableMediaId::MainAudio | StableMediaId::MainVideo => "main",
            StableMediaId::PresentationVideo => "slides",
        }
    }

    pub fn from_mid(mid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == mid)
    }
}

impl std::fmt::Display for StableMediaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which engine-assigned mid currently carries each role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MidRoles {
    pub main_audio: Option<String>,
    pub main_video: Option<String>,
    pub presentation_video: Option<String>,
}

impl MidRoles {
    pub fn with(mut self, role: StableMediaId, mid: impl Into<String>) -> Self {
        let slot = match role {
            StableMediaId::MainAudio => &mut self.main_audio,
            StableMediaId::MainVideo => &mut self.main_video,
            StableMediaId::PresentationVideo => &mut self.presentation_video,
        };
        *slot = Some(mid.into());
        self
    }

    pub fn mid_for(&self, role: StableMediaId) -> Option<&str> {
        match role {
            StableMediaId::MainAudio => self.main_audio.as_deref(),
            StableMediaId::MainVideo => self.main_video.as_deref(),
            StableMediaId::PresentationVideo => self.presentation_video.as_deref(),
        }
    }

    /// Role of the line identified by `mid`.
    ///
    /// A mid that already carries the stable text of a tracked role maps to
    /// that role, so a description that went through [`mangle`] once is
    /// recognised again.
    pub fn role_for(&self, mid: &str) -> Option<StableMediaId> {
        StableMediaId::ALL
            .into_iter()
            .find(|role| self.mid_for(*role) == Some(mid))
            .or_else(|| {
                StableMediaId::from_mid(mid).filter(|role| self.mid_for(*role).is_some())
            })
    }

    /// The mid to put on the wire for an engine-reported mid.
    pub fn stable_mid(&self, mid: &str) -> String {
        self.role_for(mid)
            .map(|role| role.as_str().to_string())
            .unwrap_or_else(|| mid.to_string())
    }
}

/// ICE ufrag -> pwd for every tracked media line.
pub type MidCredentialMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mangled {
    pub description: SessionDescription,
    pub credentials: MidCredentialMap,
}

const MID: &str = "a=mid:";
const UFRAG: &str = "a=ice-ufrag:";
const PWD: &str = "a=ice-pwd:";
const CONTENT: &str = "a=content:";
const BUNDLE: &str = "a=group:BUNDLE";

fn attribute<'a>(lines: &[&'a str], prefix: &str) -> Option<&'a str> {
    lines
        .iter()
        .find_map(|line| line.strip_prefix(prefix))
        .map(str::trim)
}

/// Rename tracked media lines to their stable ids and collect their credentials.
///
/// Pure: the output depends only on `description` and `roles`.
pub fn mangle(description: &SessionDescription, roles: &MidRoles) -> Mangled {
    let eol = if description.sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = description
        .sdp
        .lines()
        .filter(|line| !line.is_empty())
        .collect();

    let first_media = lines
        .iter()
        .position(|line| line.starts_with("m="))
        .unwrap_or(lines.len());
    let (session, media) = lines.split_at(first_media);

    let session_ufrag = attribute(session, UFRAG);
    let session_pwd = attribute(session, PWD);

    let mut sections: Vec<Vec<&str>> = Vec::new();
    for &line in media {
        if line.starts_with("m=") || sections.is_empty() {
            sections.push(Vec::new());
        }
        if let Some(section) = sections.last_mut() {
            section.push(line);
        }
    }

    let mut renamed: BTreeMap<String, &'static str> = BTreeMap::new();
    let mut credentials = MidCredentialMap::new();
    let mut media_out: Vec<String> = Vec::with_capacity(media.len());

    for section in &sections {
        let role = attribute(section, MID).and_then(|mid| roles.role_for(mid));
        let Some(role) = role else {
            media_out.extend(section.iter().map(|line| line.to_string()));
            continue;
        };

        if let Some(mid) = attribute(section, MID) {
            renamed.insert(mid.to_string(), role.as_str());
        }
        let ufrag = attribute(section, UFRAG).or(session_ufrag);
        let pwd = attribute(section, PWD).or(session_pwd);
        if let (Some(ufrag), Some(pwd)) = (ufrag, pwd) {
            credentials.insert(ufrag.to_string(), pwd.to_string());
        }

        let has_content = section.iter().any(|line| line.starts_with(CONTENT));
        for line in section {
            if line.starts_with(MID) {
                media_out.push(format!("{MID}{}", role.as_str()));
                if !has_content {
                    media_out.push(format!("{CONTENT}{}", role.content()));
                }
            } else {
                media_out.push(line.to_string());
            }
        }
    }

    let session_out = session.iter().map(|line| match line.strip_prefix(BUNDLE) {
        Some(mids) => {
            let mids: Vec<&str> = mids
                .split_whitespace()
                .map(|mid| renamed.get(mid).map_or(mid, |stable| *stable))
                .collect();
            format!("{BUNDLE} {}", mids.join(" "))
        }
        None => line.to_string(),
    });

    let mut sdp = String::with_capacity(description.sdp.len() + 64);
    for line in session_out.chain(media_out) {
        sdp.push_str(&line);
        sdp.push_str(eol);
    }

    Mangled {
        description: SessionDescription {
            kind: description.kind,
            sdp,
        },
        credentials,
    }
}

/// Extract the `ufrag` extension from an ICE candidate line.
pub fn candidate_ufrag(candidate: &str) -> Option<&str> {
    let mut tokens = candidate.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "ufrag" {
            return tokens.next();
        }
    }
    None
}
