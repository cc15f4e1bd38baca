//! Fixed level table the controller selects among, high to low, plus the
//! per-level fallback chain tried before a failed level is penalised.

/// One rung of the level table. `max_bitrate_kbps == 0` means unlimited
/// (the top layer).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Level {
    pub id: String,
    pub label: String,
    pub max_bitrate_kbps: u32,
    #[serde(default)]
    pub audio_only: bool,
}

impl Level {
    pub fn is_unlimited(&self) -> bool {
        self.max_bitrate_kbps == 0
    }
}

/// One level plus the codecs to try, in order, before the level itself is
/// treated as failed (e.g. HEVC primary, H.264 fallback).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEntry {
    pub level: Level,
    #[serde(default)]
    pub fallback_chain: Vec<String>,
}

/// The ordered set of levels a controller can switch between.
#[derive(Debug, Clone, Default)]
pub struct LevelTable {
    entries: Vec<LevelEntry>,
}

impl LevelTable {
    pub fn new(entries: Vec<LevelEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LevelEntry> {
        self.entries.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.level.id == id)
    }

    /// Index immediately above `index` (toward the unlimited top), if any.
    pub fn next_higher(&self, index: usize) -> Option<usize> {
        index.checked_sub(1)
    }

    /// Index immediately below `index` (toward audio-only), if any.
    pub fn next_lower(&self, index: usize) -> Option<usize> {
        let next = index + 1;
        if next < self.entries.len() {
            Some(next)
        } else {
            None
        }
    }

    pub fn top(&self) -> Option<usize> {
        if self.entries.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> LevelTable {
        LevelTable::new(vec![
            LevelEntry { level: Level { id: "high".into(), label: "High".into(), max_bitrate_kbps: 0, audio_only: false }, fallback_chain: vec![] },
            LevelEntry { level: Level { id: "medium".into(), label: "Medium".into(), max_bitrate_kbps: 1200, audio_only: false }, fallback_chain: vec![] },
            LevelEntry { level: Level { id: "low".into(), label: "Low".into(), max_bitrate_kbps: 400, audio_only: false }, fallback_chain: vec![] },
            LevelEntry { level: Level { id: "audio".into(), label: "Audio only".into(), max_bitrate_kbps: 40, audio_only: true }, fallback_chain: vec![] },
        ])
    }

    #[test]
    fn next_lower_steps_toward_audio_only() {
        let table = table();
        assert_eq!(table.next_lower(0), Some(1));
        assert_eq!(table.next_lower(3), None);
    }

    #[test]
    fn next_higher_steps_toward_top() {
        let table = table();
        assert_eq!(table.next_higher(0), None);
        assert_eq!(table.next_higher(2), Some(1));
    }

    #[test]
    fn top_level_is_unlimited() {
        let table = table();
        let top = table.get(table.top().unwrap()).unwrap();
        assert!(top.level.is_unlimited());
    }
}
