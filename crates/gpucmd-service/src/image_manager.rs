//! Externally supplied images that can back texture level 0.
//!
//! Images are registered by the embedder, not the client. Pixels are tightly packed RGBA8.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

#[derive(Debug, PartialEq, Eq)]
pub struct GpuImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl GpuImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self { width, height, pixels }
    }

    /// An image filled with one RGBA8 value.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = rgba.repeat(width as usize * height as usize);
        Self::new(width, height, pixels)
    }
}

#[derive(Debug, Default)]
pub struct ImageManager {
    images: HashMap<u32, Arc<GpuImage>>,
}

impl ImageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `image` under `id`, replacing any previous image with that id.
    pub fn register(&mut self, id: u32, image: Arc<GpuImage>) {
        debug!(id, width = image.width, height = image.height, "registered image");
        self.images.insert(id, image);
    }

    /// Textures already bound to the image keep their own reference.
    pub fn remove(&mut self, id: u32) -> Option<Arc<GpuImage>> {
        self.images.remove(&id)
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<GpuImage>> {
        self.images.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_images_survive_while_referenced() {
        let mut images = ImageManager::new();
        images.register(1, Arc::new(GpuImage::solid(2, 1, [1, 2, 3, 4])));
        let held = images.lookup(1).unwrap();
        assert_eq!(held.pixels, vec![1, 2, 3, 4, 1, 2, 3, 4]);

        images.remove(1);
        assert!(images.lookup(1).is_none());
        assert_eq!(held.width, 2);
    }
}
