use super::types::{ContainerDescriptor, Environment};

/// Env suffixes recognized when renaming across the pipeline.
const KNOWN_SUFFIXES: &[&str] = &["-dev", "-staging"];

/// Apply the target environment's profile to a descriptor: rename the
/// container, retag the image if its tag carries an env suffix, and scale
/// resources and replicas. Everything else is preserved.
pub fn transform(descriptor: &ContainerDescriptor, target: Environment) -> ContainerDescriptor {
    let profile = target.profile();
    let mut out = descriptor.clone();

    out.container_name = format!(
        "{}{}",
        strip_env_suffix(&descriptor.container_name),
        profile.suffix
    );
    out.image_tag = retag(&descriptor.image_tag, profile.suffix);
    out.cpu_limit = Some(profile.cpu);
    out.memory_limit = Some(profile.memory_bytes);
    out.replicas = profile.replicas;

    out
}

fn strip_env_suffix(name: &str) -> &str {
    for suffix in KNOWN_SUFFIXES {
        if let Some(base) = name.strip_suffix(suffix) {
            if !base.is_empty() {
                return base;
            }
        }
    }
    name
}

/// Retag `repo:x-ENV` style references; references without an env-suffixed
/// tag pass through unchanged.
fn retag(image: &str, target_suffix: &str) -> String {
    let Some((repo, tag)) = split_tag(image) else {
        return image.to_string();
    };

    for suffix in KNOWN_SUFFIXES {
        if let Some(base) = tag.strip_suffix(suffix) {
            if !base.is_empty() {
                return format!("{}:{}{}", repo, base, target_suffix);
            }
        }
    }
    image.to_string()
}

/// Split an image reference into repository and tag, leaving registry ports
/// (`registry:5000/app`) alone.
fn split_tag(image: &str) -> Option<(&str, &str)> {
    let idx = image.rfind(':')?;
    if image[idx..].contains('/') {
        return None;
    }
    Some((&image[..idx], &image[idx + 1..]))
}

#[cfg(test)]
mod tests {
    use super::super::types::sample_descriptor;
    use super::*;

    #[test]
    fn rename_appends_target_suffix() {
        let desc = sample_descriptor();
        let staged = transform(&desc, Environment::Staging);
        assert_eq!(staged.container_name, "grafana-staging");

        let prod = transform(&staged, Environment::Prod);
        assert_eq!(prod.container_name, "grafana");
    }

    #[test]
    fn profile_scales_resources() {
        let desc = sample_descriptor();
        let staged = transform(&desc, Environment::Staging);
        assert_eq!(staged.cpu_limit, Some(1.0));
        assert_eq!(staged.memory_limit, Some(1024 * 1024 * 1024));
        assert_eq!(staged.replicas, 2);
    }

    #[test]
    fn untouched_fields_are_preserved() {
        let desc = sample_descriptor();
        let staged = transform(&desc, Environment::Staging);
        assert_eq!(staged.environment, desc.environment);
        assert_eq!(staged.volumes, desc.volumes);
        assert_eq!(staged.port_bindings, desc.port_bindings);
        assert_eq!(staged.labels, desc.labels);
        assert_eq!(staged.healthcheck_endpoint, desc.healthcheck_endpoint);
    }

    #[test]
    fn env_tags_are_retagged() {
        assert_eq!(retag("myapp:1.2-dev", "-staging"), "myapp:1.2-staging");
        assert_eq!(retag("myapp:1.2-staging", ""), "myapp:1.2");
        assert_eq!(retag("myapp:1.2", "-staging"), "myapp:1.2");
        assert_eq!(
            retag("grafana/grafana:10.4.0", "-staging"),
            "grafana/grafana:10.4.0"
        );
        // A registry port is not a tag.
        assert_eq!(
            retag("registry:5000/app", "-staging"),
            "registry:5000/app"
        );
    }

    #[test]
    fn suffix_stripping_keeps_bare_names() {
        assert_eq!(strip_env_suffix("myapp-dev"), "myapp");
        assert_eq!(strip_env_suffix("myapp-staging"), "myapp");
        assert_eq!(strip_env_suffix("myapp"), "myapp");
        assert_eq!(strip_env_suffix("-dev"), "-dev");
    }
}
