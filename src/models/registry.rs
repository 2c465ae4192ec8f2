/// A model category known to ComfyUI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryInfo {
    pub key: &'static str,
    pub description: &'static str,
}

/// Registry of well-known model categories
///
/// Manifest entries are not restricted to these; unknown keys become
/// directories verbatim. The registry only drives warnings and suggestions.
pub const CATEGORIES: &[CategoryInfo] = &[
    CategoryInfo {
        key: "checkpoints",
        description: "Full diffusion model checkpoints",
    },
    CategoryInfo {
        key: "loras",
        description: "LoRA adapters",
    },
    CategoryInfo {
        key: "controlnet",
        description: "ControlNet models",
    },
    CategoryInfo {
        key: "vae",
        description: "VAE encoders/decoders",
    },
    CategoryInfo {
        key: "embeddings",
        description: "Textual inversion embeddings",
    },
    CategoryInfo {
        key: "clip",
        description: "CLIP text encoders",
    },
    CategoryInfo {
        key: "clip_vision",
        description: "CLIP vision encoders",
    },
    CategoryInfo {
        key: "upscale_models",
        description: "Image upscalers",
    },
    CategoryInfo {
        key: "insightface",
        description: "Face analysis models",
    },
    CategoryInfo {
        key: "ultralytics",
        description: "Detection models",
    },
    CategoryInfo {
        key: "unet",
        description: "Standalone UNet weights",
    },
    CategoryInfo {
        key: "diffusion_models",
        description: "Standalone diffusion weights",
    },
    CategoryInfo {
        key: "text_encoders",
        description: "Text encoders",
    },
];

impl CategoryInfo {
    /// Find category by key
    #[must_use]
    pub fn find(key: &str) -> Option<&'static Self> {
        CATEGORIES.iter().find(|c| c.key == key)
    }

    /// Find closest known category using Levenshtein distance
    #[must_use]
    pub fn suggest(key: &str) -> Option<&'static str> {
        if key.is_empty() {
            return None;
        }

        CATEGORIES
            .iter()
            .map(|c| (c.key, levenshtein_distance(key, c.key)))
            .min_by_key(|(_, dist)| *dist)
            .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
            .map(|(category, _)| category)
    }
}

/// Calculate Levenshtein distance between two strings
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s2_chars: Vec<char> = s2.chars().collect();
    let mut previous: Vec<usize> = (0..=s2_chars.len()).collect();

    for (i, c1) in s1.chars().enumerate() {
        let mut current = vec![i + 1; s2_chars.len() + 1];
        for (j, c2) in s2_chars.iter().enumerate() {
            let cost = usize::from(c1 != *c2);
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        previous = current;
    }

    previous[s2_chars.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_category() {
        assert!(CategoryInfo::find("loras").is_some());
        assert!(CategoryInfo::find("checkpoints").is_some());
        assert!(CategoryInfo::find("my_custom_models").is_none());
    }

    #[test]
    fn test_suggest() {
        assert_eq!(CategoryInfo::suggest("lora"), Some("loras"));
        assert_eq!(CategoryInfo::suggest("checkpoint"), Some("checkpoints"));
        assert_eq!(CategoryInfo::suggest("controlnets"), Some("controlnet"));
        assert_eq!(CategoryInfo::suggest("completely_custom"), None);
        assert_eq!(CategoryInfo::suggest(""), None);
    }

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("", ""), 0);
        assert_eq!(levenshtein_distance("", "vae"), 3);
        assert_eq!(levenshtein_distance("vae", "vae"), 0);
        assert_eq!(levenshtein_distance("lora", "loras"), 1);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
    }
}
