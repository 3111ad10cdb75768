use crate::genotype::Genotype;
use serde_yaml::{Mapping, Value};


/// Nest the expressed alleles under their dotted paths, e.g. `optim.lr`
/// becomes `{optim: {lr: ...}}`.
pub fn expand(genotype: &Genotype) -> Value {
    let mut root = Mapping::new();

    for (name, allele) in genotype.genes.iter() {
        let mut parts = name.split('.').peekable();
        let mut current = &mut root;

        while let Some(part) = parts.next() {
            let key = Value::from(part);

            if parts.peek().is_none() {
                current.insert(key, allele.express());
                break;
            }

            let entry = current
                .entry(key)
                .or_insert_with(|| Value::Mapping(Mapping::new()));
            if !entry.is_mapping() {
                *entry = Value::Mapping(Mapping::new());
            }

            current = match entry {
                Value::Mapping(mapping) => mapping,
                _ => unreachable!("entry was just made a mapping"),
            };
        }
    }

    Value::Mapping(root)
}

/// Recursively merge `overlay` onto `base`.
///
/// Mappings are merged key by key; any other value replaces what was there.
/// Keys starting with `_` are always replaced wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay.iter() {
                let opaque = key.as_str().map_or(false, |key| key.starts_with('_'));

                match base.get_mut(key) {
                    Some(existing) if !opaque && existing.is_mapping() && value.is_mapping() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
