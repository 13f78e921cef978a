use std::collections::VecDeque;

use rand::seq::SliceRandom;

use crate::protocol::tracks::Track;

/// Ordered container of pending tracks for one player.
#[derive(Debug, Default)]
pub struct Queue {
    tracks: VecDeque<Track>,
}

impl Queue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Total duration of the queue in milliseconds.
    pub fn duration(&self) -> u64 {
        self.tracks.iter().map(|track| track.info.length).sum()
    }

    pub fn first(&self) -> Option<&Track> {
        self.tracks.front()
    }

    /// Append a track to the tail.
    pub fn add(&mut self, track: Track) {
        self.tracks.push_back(track);
    }

    /// Append several tracks, preserving their order.
    pub fn add_many(&mut self, tracks: impl IntoIterator<Item = Track>) {
        self.tracks.extend(tracks);
    }

    /// Pop the head of the queue.
    pub fn remove_first(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn shuffle(&mut self) {
        let mut tracks: Vec<Track> = self.tracks.drain(..).collect();
        tracks.shuffle(&mut rand::thread_rng());
        self.tracks = tracks.into();
    }

    /// Remove the track at `index`, or `None` if out of bounds.
    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.tracks.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    /// Move a track from one position to another, returning a reference to
    /// it, or `None` if either index is out of bounds.
    pub fn move_track(&mut self, from: usize, to: usize) -> Option<&Track> {
        if from >= self.tracks.len() || to >= self.tracks.len() {
            return None;
        }
        let track = self.tracks.remove(from)?;
        self.tracks.insert(to, track);
        self.tracks.get(to)
    }

    pub fn as_vec(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tracks::TrackInfo;

    fn track(identifier: &str, length: u64) -> Track {
        let info = TrackInfo {
            identifier: identifier.to_string(),
            is_seekable: true,
            author: "author".to_string(),
            length,
            is_stream: false,
            position: 0,
            title: identifier.to_string(),
            uri: None,
            artwork_url: None,
            isrc: None,
            source_name: "youtube".to_string(),
        };
        Track {
            encoded: Track::encode(&info),
            info,
            plugin_info: serde_json::json!({}),
            user_data: serde_json::json!({}),
        }
    }

    #[test]
    fn fifo_order() {
        let mut queue = Queue::new();
        queue.add(track("a", 1000));
        queue.add(track("b", 2000));
        queue.add(track("c", 3000));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.duration(), 6000);
        assert_eq!(queue.remove_first().unwrap().info.identifier, "a");
        assert_eq!(queue.remove_first().unwrap().info.identifier, "b");
        assert_eq!(queue.remove_first().unwrap().info.identifier, "c");
        assert!(queue.remove_first().is_none());
    }

    #[test]
    fn remove_respects_bounds() {
        let mut queue = Queue::new();
        queue.add(track("a", 0));
        assert!(queue.remove(5).is_none());
        assert_eq!(queue.remove(0).unwrap().info.identifier, "a");
        assert!(queue.is_empty());
    }

    #[test]
    fn move_track_reorders() {
        let mut queue = Queue::new();
        queue.add_many([track("a", 0), track("b", 0), track("c", 0)]);

        assert_eq!(queue.move_track(2, 0).unwrap().info.identifier, "c");
        let order: Vec<String> = queue
            .as_vec()
            .into_iter()
            .map(|t| t.info.identifier)
            .collect();
        assert_eq!(order, ["c", "a", "b"]);

        assert!(queue.move_track(0, 9).is_none());
    }

    #[test]
    fn shuffle_keeps_contents() {
        let mut queue = Queue::new();
        for i in 0..32 {
            queue.add(track(&format!("t{i}"), 0));
        }
        queue.shuffle();
        assert_eq!(queue.len(), 32);
        let mut ids: Vec<String> = queue
            .as_vec()
            .into_iter()
            .map(|t| t.info.identifier)
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
    }
}
