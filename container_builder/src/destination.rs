//! Destination references for built images, `<registry>/<namespace>/<base>[-<image type>]-<name>:<tag>`.
//!
//! Components are validated against the reference grammar of the
//! [distribution](https://github.com/distribution/distribution/blob/v2.7.1/reference/reference.go) project:
//!
//! ```text
//! name             := [domain '/'] path-component ['/' path-component]*
//! domain           := domain-component ['.' domain-component]* [':' port-number]
//! domain-component := /([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])/
//! path-component   := alpha-numeric [separator alpha-numeric]*
//! separator        := /[_.]|__|[-]*/
//! tag              := /[\w][\w.-]{0,127}/
//! ```

use std::{fmt, sync::LazyLock};

use regex::Regex;

const DOMAIN_COMPONENT: &str = r"(?:[a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9-]*[a-zA-Z0-9])";
const PATH_COMPONENT: &str = r"[a-z0-9]+(?:(?:[._]|__|[-]*)[a-z0-9]+)*";
const TAG: &str = r"[\w][\w.-]{0,127}";

fn anchored(pattern: &str) -> Regex {
    Regex::new(&format!("^(?:{pattern})$")).expect("pattern is valid")
}

static DOMAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    anchored(&format!(
        r"{DOMAIN_COMPONENT}(?:\.{DOMAIN_COMPONENT})*(?::[0-9]+)?"
    ))
});
static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| anchored(&format!(r"{PATH_COMPONENT}(?:/{PATH_COMPONENT})*")));
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| anchored(TAG));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDestination {
    pub part: &'static str,
    pub value: String,
}

impl std::error::Error for InvalidDestination {}

impl fmt::Display for InvalidDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid destination {part} {value:?}",
            part = self.part,
            value = self.value
        )
    }
}

fn check(re: &Regex, part: &'static str, value: &str) -> Result<(), InvalidDestination> {
    if re.is_match(value) {
        Ok(())
    } else {
        Err(InvalidDestination {
            part,
            value: value.to_owned(),
        })
    }
}

/// Everything except the image name that makes up a destination.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Repository {
    /// `<host>:<port>`
    pub registry: String,
    pub namespace: String,
    pub base: String,
    /// Omitted from the destination when empty.
    pub image_type: String,
    pub tag: String,
}

impl Repository {
    /// Returns the image prefix `<base>[-<image type>]`.
    fn prefix(&self) -> String {
        if self.image_type.is_empty() {
            self.base.clone()
        } else {
            format!("{}-{}", self.base, self.image_type)
        }
    }

    pub fn validate(&self) -> Result<(), InvalidDestination> {
        check(&DOMAIN_RE, "registry", &self.registry)?;
        check(&PATH_RE, "namespace", &self.namespace)?;
        check(&PATH_RE, "base", &self.prefix())?;
        check(&TAG_RE, "tag", &self.tag)
    }

    /// Formats the destination of the named image.
    pub fn destination(&self, name: &str) -> String {
        format!(
            "{registry}/{namespace}/{prefix}-{name}:{tag}",
            registry = self.registry,
            namespace = self.namespace,
            prefix = self.prefix(),
            tag = self.tag,
        )
    }

    /// Like [`Repository::destination`], but rejects names that do not form a valid reference.
    pub fn checked_destination(&self, name: &str) -> Result<String, InvalidDestination> {
        check(&PATH_RE, "image name", &format!("{}-{name}", self.prefix()))?;
        Ok(self.destination(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repository(image_type: &str) -> Repository {
        Repository {
            registry: "127.0.0.1:8787".to_owned(),
            namespace: "master".to_owned(),
            base: "fedora".to_owned(),
            image_type: image_type.to_owned(),
            tag: "latest".to_owned(),
        }
    }

    #[test]
    fn test_destination_with_image_type() {
        assert_eq!(
            repository("binary").destination("base"),
            "127.0.0.1:8787/master/fedora-binary-base:latest"
        );
    }

    #[test]
    fn test_destination_without_image_type() {
        assert_eq!(
            repository("").destination("nova-api"),
            "127.0.0.1:8787/master/fedora-nova-api:latest"
        );
    }

    #[test]
    fn test_validate() {
        assert_eq!(repository("binary").validate(), Ok(()));

        let mut invalid = repository("binary");
        invalid.registry = "-bad-:8787".to_owned();
        assert_eq!(invalid.validate().unwrap_err().part, "registry");

        let mut invalid = repository("binary");
        invalid.tag = ".latest".to_owned();
        assert_eq!(invalid.validate().unwrap_err().part, "tag");

        let mut nested = repository("");
        nested.namespace = "tripleo/master".to_owned();
        assert_eq!(nested.validate(), Ok(()));
    }

    #[test]
    fn test_checked_destination() {
        let repository = repository("binary");
        assert_eq!(
            repository.checked_destination("nova-compute").as_deref(),
            Ok("127.0.0.1:8787/master/fedora-binary-nova-compute:latest")
        );
        assert_eq!(
            repository.checked_destination("Nova").unwrap_err(),
            InvalidDestination {
                part: "image name",
                value: "fedora-binary-Nova".to_owned()
            }
        );
    }
}
