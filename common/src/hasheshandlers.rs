use crate::{ANNOTATION_LAST_APPLIED, Error, LABEL_POD_TEMPLATE_HASH, Result};
use k8s_openapi::api::core::v1::PodTemplateSpec;

/// Length of the hash suffix used in generation names and labels
pub static HASH_LEN: usize = 10;

/// Drop the fields this operator injects itself, so that a template read back
/// from the API server hashes like the freshly rendered one
pub fn normalize_template(template: &PodTemplateSpec) -> PodTemplateSpec {
    let mut tpl = template.clone();
    if let Some(meta) = tpl.metadata.as_mut() {
        if let Some(labels) = meta.labels.as_mut() {
            labels.remove(LABEL_POD_TEMPLATE_HASH);
            if labels.is_empty() {
                meta.labels = None;
            }
        }
        if let Some(annotations) = meta.annotations.as_mut() {
            annotations.remove(ANNOTATION_LAST_APPLIED);
            if annotations.is_empty() {
                meta.annotations = None;
            }
        }
    }
    tpl
}

/// Canonical JSON form of a pod template (object keys sorted)
pub fn template_json(template: &PodTemplateSpec) -> Result<String> {
    let value = serde_json::to_value(normalize_template(template)).map_err(Error::SerializationError)?;
    serde_json::to_string(&value).map_err(Error::SerializationError)
}

/// Stable identity of a pod template revision.
///
/// Bumping the collision count yields another, deterministic, identity for
/// the same template.
pub fn template_hash(template: &PodTemplateSpec, collision_count: i32) -> Result<String> {
    let json = template_json(template)?;
    let digest = if collision_count > 0 {
        sha256::digest(format!("{json}{collision_count}"))
    } else {
        sha256::digest(json)
    };
    Ok(digest[..HASH_LEN].to_string())
}

/// Short digest of a configuration text
pub fn config_hash(text: &str) -> String {
    sha256::digest(text)[..HASH_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{
        api::core::v1::{Container, PodSpec},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };
    use std::collections::BTreeMap;

    fn template(image: &str) -> PodTemplateSpec {
        PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(BTreeMap::from([("app".to_string(), "mqtt".to_string())])),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "broker".to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_hash_is_stable() {
        let a = template_hash(&template("emqx:5.1.0"), 0).unwrap();
        let b = template_hash(&template("emqx:5.1.0"), 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), HASH_LEN);
    }

    #[test]
    fn test_hash_ignores_injected_fields() {
        let plain = template("emqx:5.1.0");
        let mut injected = plain.clone();
        let meta = injected.metadata.as_mut().unwrap();
        meta.labels
            .as_mut()
            .unwrap()
            .insert(LABEL_POD_TEMPLATE_HASH.to_string(), "0123456789".to_string());
        meta.annotations = Some(BTreeMap::from([(
            ANNOTATION_LAST_APPLIED.to_string(),
            "{}".to_string(),
        )]));
        assert_eq!(template_hash(&plain, 0).unwrap(), template_hash(&injected, 0).unwrap());
    }

    #[test]
    fn test_hash_changes_on_drift() {
        assert_ne!(
            template_hash(&template("emqx:5.1.0"), 0).unwrap(),
            template_hash(&template("emqx:5.1.1"), 0).unwrap()
        );
    }

    #[test]
    fn test_collision_count_changes_hash() {
        let tpl = template("emqx:5.1.0");
        let h0 = template_hash(&tpl, 0).unwrap();
        let h1 = template_hash(&tpl, 1).unwrap();
        let h2 = template_hash(&tpl, 2).unwrap();
        assert_ne!(h0, h1);
        assert_ne!(h1, h2);
        assert_eq!(h1, template_hash(&tpl, 1).unwrap());
    }
}
