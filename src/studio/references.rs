use crate::llm::media::DecodedImage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// Fixes the persona's face and body.
    Identity,
    /// Pose, lighting and composition only.
    Style,
}

impl ReferenceKind {
    pub fn label(self) -> &'static str {
        match self {
            ReferenceKind::Identity => "identity",
            ReferenceKind::Style => "style",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('/').to_lowercase().as_str() {
            "identity" | "id" | "model" => Some(ReferenceKind::Identity),
            "style" | "pose" => Some(ReferenceKind::Style),
            _ => None,
        }
    }

    fn default_active(self) -> bool {
        match self {
            ReferenceKind::Identity => true,
            ReferenceKind::Style => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub name: String,
    pub image: DecodedImage,
    pub active: bool,
}

/// Insertion-ordered reference images, unique by file name.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    kind: ReferenceKind,
    items: Vec<ReferenceImage>,
}

impl ReferenceStore {
    pub fn new(kind: ReferenceKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceImage> {
        self.items.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ReferenceImage> {
        self.items.get(index)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|item| item.name == name)
    }

    /// Appends unless an entry with the same name already exists. The name is
    /// the identity key: a re-upload with different bytes is still a duplicate.
    pub fn add(&mut self, name: &str, image: DecodedImage) -> bool {
        if self.contains(name) {
            return false;
        }
        self.items.push(ReferenceImage {
            name: name.to_string(),
            image,
            active: self.kind.default_active(),
        });
        true
    }

    pub fn remove(&mut self, index: usize) -> Option<ReferenceImage> {
        if index >= self.items.len() {
            return None;
        }
        Some(self.items.remove(index))
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.items.len();
        self.items.clear();
        removed
    }

    /// Flips the inclusion flag and returns the new value.
    pub fn toggle(&mut self, index: usize) -> Option<bool> {
        let item = self.items.get_mut(index)?;
        item.active = !item.active;
        Some(item.active)
    }

    pub fn active_images(&self) -> Vec<&DecodedImage> {
        self.items
            .iter()
            .filter(|item| item.active)
            .map(|item| &item.image)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.items.iter().filter(|item| item.active).count()
    }
}

#[cfg(test)]
mod tests {
    use image::DynamicImage;

    use super::*;

    fn bitmap(width: u32) -> DecodedImage {
        DecodedImage {
            image: DynamicImage::new_rgb8(width, 1),
            bytes: vec![width as u8],
            mime_type: "image/png".to_string(),
        }
    }

    fn names(store: &ReferenceStore) -> Vec<&str> {
        store.iter().map(|item| item.name.as_str()).collect()
    }

    #[test]
    fn same_name_is_stored_once_even_with_different_bytes() {
        let mut store = ReferenceStore::new(ReferenceKind::Identity);
        assert!(store.add("face.png", bitmap(1)));
        assert!(!store.add("face.png", bitmap(2)));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0).unwrap().image.bytes, vec![1]);
    }

    #[test]
    fn remove_keeps_relative_order() {
        let mut store = ReferenceStore::new(ReferenceKind::Style);
        for name in ["a", "b", "c", "d"] {
            store.add(name, bitmap(1));
        }

        let removed = store.remove(1).unwrap();
        assert_eq!(removed.name, "b");
        assert_eq!(names(&store), vec!["a", "c", "d"]);
    }

    #[test]
    fn remove_out_of_range_is_a_no_op() {
        let mut store = ReferenceStore::new(ReferenceKind::Style);
        store.add("a", bitmap(1));

        assert!(store.remove(1).is_none());
        assert!(store.toggle(5).is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn active_images_follow_toggles_in_insertion_order() {
        let mut store = ReferenceStore::new(ReferenceKind::Identity);
        for width in 1..=4 {
            store.add(&format!("ref-{width}"), bitmap(width));
        }

        assert_eq!(store.toggle(0), Some(false));
        assert_eq!(store.toggle(2), Some(false));
        assert_eq!(store.toggle(0), Some(true));

        let widths: Vec<u32> = store
            .active_images()
            .iter()
            .map(|image| image.image.width())
            .collect();
        assert_eq!(widths, vec![1, 2, 4]);
        assert_eq!(store.active_count(), 3);
    }

    #[test]
    fn new_entries_start_active_in_both_stores() {
        let mut identity = ReferenceStore::new(ReferenceKind::Identity);
        let mut style = ReferenceStore::new(ReferenceKind::Style);
        identity.add("a", bitmap(1));
        style.add("b", bitmap(1));

        assert!(identity.get(0).unwrap().active);
        assert!(style.get(0).unwrap().active);
    }

    #[test]
    fn clear_empties_the_store() {
        let mut store = ReferenceStore::new(ReferenceKind::Style);
        store.add("a", bitmap(1));
        store.add("b", bitmap(1));

        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert!(store.active_images().is_empty());
    }

    #[test]
    fn parses_kind_labels() {
        assert_eq!(ReferenceKind::parse("Identity"), Some(ReferenceKind::Identity));
        assert_eq!(ReferenceKind::parse("/style"), Some(ReferenceKind::Style));
        assert_eq!(ReferenceKind::parse("pose"), Some(ReferenceKind::Style));
        assert_eq!(ReferenceKind::parse("other"), None);
    }
}
