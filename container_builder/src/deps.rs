use std::{collections::HashMap, fmt};

use log::warn;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

/// A recursive description of which images must be built before which.
///
/// A mapping entry `parent: children` means the parent image is built from, and therefore after, its children.
/// Scalar elements of a list form a layer of their own, mappings inside a list contribute their parents to that
/// layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Deps {
    Scalar(String),
    Map(Vec<(String, Deps)>),
    List(Vec<Deps>),
}

/// Names of images that can be built concurrently.
pub type Layer = Vec<String>;

impl Default for Deps {
    fn default() -> Self {
        Deps::List(Vec::new())
    }
}

impl From<&str> for Deps {
    fn from(value: &str) -> Self {
        Deps::Scalar(value.to_owned())
    }
}

impl Deps {
    pub fn is_empty(&self) -> bool {
        match self {
            Deps::Scalar(_) => false,
            Deps::Map(entries) => entries.is_empty(),
            Deps::List(items) => items.iter().all(Deps::is_empty),
        }
    }

    /// Every distinct name in traversal order.
    pub fn names(&self) -> Vec<&str> {
        fn collect<'a>(deps: &'a Deps, out: &mut Vec<&'a str>) {
            match deps {
                Deps::Scalar(name) => out.push(name),
                Deps::Map(entries) => {
                    for (parent, children) in entries {
                        out.push(parent);
                        collect(children, out);
                    }
                }
                Deps::List(items) => items.iter().for_each(|item| collect(item, out)),
            }
        }

        let mut out = Vec::new();
        collect(self, &mut out);
        let mut seen = std::collections::HashSet::new();
        out.retain(|name| seen.insert(*name));
        out
    }

    /// The names a parent holding this description depends on directly.
    fn roots(&self) -> Vec<&str> {
        match self {
            Deps::Scalar(name) => vec![name.as_str()],
            Deps::Map(entries) => entries.iter().map(|(parent, _)| parent.as_str()).collect(),
            Deps::List(items) => items.iter().flat_map(Deps::roots).collect(),
        }
    }

    /// Every `(parent, child)` edge.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::new();
        match self {
            Deps::Scalar(_) => {}
            Deps::Map(entries) => {
                for (parent, children) in entries {
                    out.extend(children.roots().into_iter().map(|child| (parent.as_str(), child)));
                    out.extend(children.edges());
                }
            }
            Deps::List(items) => out.extend(items.iter().flat_map(Deps::edges)),
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclicDependency {
    pub names: Vec<String>,
}

impl std::error::Error for CyclicDependency {}

impl fmt::Display for CyclicDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the dependency description contains a cycle involving {}",
            self.names.join(", ")
        )
    }
}

/// Orders the images into layers such that every image comes after the images it depends on.
///
/// Layers follow a depth-first walk of the description, with the order inside a layer matching the order in the
/// description. A name reached through more than one path is built in the earliest layer it occurs in. Should that
/// put it ahead of one of its own dependencies, the dependents are moved to later layers.
pub fn linearize(deps: &Deps) -> Result<Vec<Layer>, CyclicDependency> {
    let mut walked = Vec::new();
    visit(deps, None, &mut walked);
    walked.reverse();

    let mut order = Vec::<&str>::new();
    let mut position = HashMap::<&str, usize>::new();
    for (index, layer) in walked.iter().enumerate() {
        for name in layer {
            match position.get(name.as_str()) {
                Some(&first) => {
                    if first != index {
                        warn!("image {name:?} is listed more than once, building it in layer {first} only");
                    }
                }
                None => {
                    position.insert(name, index);
                    order.push(name);
                }
            }
        }
    }

    let edges = deps.edges();
    let mut rounds = 0;
    loop {
        let mut changed = Vec::new();
        for &(parent, child) in &edges {
            let required = position[child] + 1;
            if position[parent] < required {
                position.insert(parent, required);
                changed.push(parent.to_owned());
            }
        }
        if changed.is_empty() {
            break;
        }
        rounds += 1;
        if rounds > order.len() {
            changed.sort();
            changed.dedup();
            return Err(CyclicDependency { names: changed });
        }
    }

    let mut layers = vec![Layer::new(); position.values().max().map_or(0, |max| max + 1)];
    for name in order {
        layers[position[name]].push(name.to_owned());
    }
    layers.retain(|layer| !layer.is_empty());
    Ok(layers)
}

/// Appends the names of `node` to `parent_layer` if given, or to new layers otherwise. Parents are emitted before
/// their children.
fn visit(node: &Deps, parent_layer: Option<usize>, layers: &mut Vec<Layer>) {
    let append = |names: Layer, layers: &mut Vec<Layer>| match parent_layer {
        Some(index) => layers[index].extend(names),
        None => layers.push(names),
    };

    match node {
        Deps::Scalar(name) => append(vec![name.clone()], layers),
        Deps::Map(entries) => {
            append(entries.iter().map(|(parent, _)| parent.clone()).collect(), layers);
            for (_, children) in entries {
                visit(children, None, layers);
            }
        }
        Deps::List(items) => {
            let (scalars, composites): (Vec<_>, Vec<_>) =
                items.iter().partition(|item| matches!(item, Deps::Scalar(_)));
            let new_parent = if scalars.is_empty() {
                None
            } else {
                layers.push(
                    scalars
                        .into_iter()
                        .filter_map(|item| match item {
                            Deps::Scalar(name) => Some(name.clone()),
                            _ => None,
                        })
                        .collect(),
                );
                Some(layers.len() - 1)
            };
            for composite in composites {
                visit(composite, new_parent, layers);
            }
        }
    }
}

impl<'de> Deserialize<'de> for Deps {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DepsVisitor;

        impl<'de> Visitor<'de> for DepsVisitor {
            type Value = Deps;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an image name, a mapping of image names or a list")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Deps, E> {
                Ok(Deps::Scalar(value.to_owned()))
            }

            fn visit_string<E: de::Error>(self, value: String) -> Result<Deps, E> {
                Ok(Deps::Scalar(value))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Deps, E> {
                Ok(Deps::default())
            }

            fn visit_none<E: de::Error>(self) -> Result<Deps, E> {
                Ok(Deps::default())
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Deps, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or_default());
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Deps::List(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Deps, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or_default());
                while let Some((parent, children)) = map.next_entry::<String, Deps>()? {
                    entries.push((parent, children));
                }
                Ok(Deps::Map(entries))
            }
        }

        deserializer.deserialize_any(DepsVisitor)
    }
}
