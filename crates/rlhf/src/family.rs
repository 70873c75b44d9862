//! Model-family compatibility.
//!
//! Two models belong to the same family when they share a tokenizer, which
//! means token ids produced for one can be fed directly to the other. Every
//! decision about re-encoding sequences between actor, critic and reward model
//! goes through [`check_model_family`].

/// Hub identifiers of the models with a shared-tokenizer catalog entry.
///
/// Anything outside this list is treated as a member of the single local
/// (LLaMA-style) family.
pub const KNOWN_HF_MODELS: &[&str] = &[
    "gpt2",
    "gpt2-medium",
    "gpt2-large",
    "gpt2-xl",
    "distilgpt2",
    "facebook/opt-125m",
    "facebook/opt-350m",
    "facebook/opt-1.3b",
    "facebook/opt-2.7b",
    "facebook/opt-6.7b",
    "facebook/opt-13b",
    "facebook/galactica-125m",
    "facebook/galactica-1.3b",
    "bigscience/bloom-560m",
    "bigscience/bloom-1b1",
    "bigscience/bloom-1b7",
    "bigscience/bloom-3b",
    "bigscience/bloomz-560m",
    "bigscience/bloomz-1b1",
    "EleutherAI/gpt-neo-125M",
    "EleutherAI/gpt-neo-1.3B",
    "EleutherAI/gpt-neo-2.7B",
    "EleutherAI/gpt-j-6B",
    "EleutherAI/pythia-70m",
    "EleutherAI/pythia-160m",
    "EleutherAI/pythia-410m",
    "EleutherAI/pythia-1b",
    "cerebras/Cerebras-GPT-111M",
    "cerebras/Cerebras-GPT-256M",
    "cerebras/Cerebras-GPT-590M",
];

/// Whether `model` is part of the shared-tokenizer catalog.
pub fn is_known_model(model: &str) -> bool {
    KNOWN_HF_MODELS.contains(&model)
}

/// Normalized family name: namespace prefix removed, then everything from the
/// first hyphen on dropped (`facebook/opt-125m` -> `opt`).
pub fn base_name(model: &str) -> &str {
    let name = match model.split_once('/') {
        Some((_, rest)) => rest,
        None => model,
    };
    match name.split_once('-') {
        Some((base, _)) => base,
        None => name,
    }
}

/// Check whether two models use the same tokenizer.
///
/// - both in the catalog: compare [`base_name`]s
/// - neither in the catalog: compatible
/// - exactly one in the catalog: incompatible
pub fn check_model_family(model_a: &str, model_b: &str) -> bool {
    match (is_known_model(model_a), is_known_model(model_b)) {
        (true, true) => base_name(model_a) == base_name(model_b),
        (false, false) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("facebook/opt-125m"), "opt");
        assert_eq!(base_name("gpt2-medium"), "gpt2");
        assert_eq!(base_name("gpt2"), "gpt2");
        assert_eq!(base_name("EleutherAI/gpt-neo-125M"), "gpt");
    }

    #[test]
    fn test_same_catalog_family() {
        assert!(check_model_family("gpt2", "gpt2-xl"));
        assert!(check_model_family("facebook/opt-125m", "facebook/opt-1.3b"));
        assert!(check_model_family("bigscience/bloom-560m", "bigscience/bloom-3b"));
    }

    #[test]
    fn test_different_catalog_family() {
        assert!(!check_model_family("gpt2", "facebook/opt-125m"));
        assert!(!check_model_family("bigscience/bloom-560m", "bigscience/bloomz-560m"));
    }

    #[test]
    fn test_models_outside_catalog_are_compatible() {
        assert!(check_model_family("llama-7B", "llama-13B"));
        assert!(check_model_family("tiny-local", "llama-7B"));
    }

    #[test]
    fn test_mixed_catalog_membership_is_incompatible() {
        assert!(!check_model_family("llama-7B", "gpt2"));
        assert!(!check_model_family("facebook/opt-125m", "llama-7B"));
    }

    #[test]
    fn test_family_check_is_symmetric() {
        let ids = [
            "gpt2",
            "gpt2-large",
            "distilgpt2",
            "facebook/opt-125m",
            "facebook/galactica-125m",
            "EleutherAI/gpt-j-6B",
            "EleutherAI/gpt-neo-125M",
            "llama-7B",
            "tiny-local",
            "",
        ];
        for a in ids {
            for b in ids {
                assert_eq!(
                    check_model_family(a, b),
                    check_model_family(b, a),
                    "asymmetric for ({a}, {b})"
                );
            }
        }
    }
}
