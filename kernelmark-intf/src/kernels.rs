// Copyright (c) The kernelmark Authors.
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

use km_util::*;

/// Kernel versions to test grouped by major version, e.g.
///
///   { "5.x": ["5.19.16", "5.19.17"], "6.x": ["6.0.1"] }
///
/// Both the order of the major groups and the order within each group
/// follow the file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelList {
    pub majors: Vec<(String, Vec<String>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEntry<'a> {
    pub major: &'a str,
    pub version: &'a str,
    pub first_of_major: bool,
}

impl KernelList {
    pub fn nr_kernels(&self) -> usize {
        self.majors.iter().map(|(_, vers)| vers.len()).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = KernelEntry<'_>> + '_ {
        self.majors.iter().flat_map(|(major, vers)| {
            vers.iter().enumerate().map(move |(idx, ver)| KernelEntry {
                major,
                version: ver,
                first_of_major: idx == 0,
            })
        })
    }
}

struct KernelListVisitor;

impl<'de> Visitor<'de> for KernelListVisitor {
    type Value = KernelList;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of major version to a list of kernel versions")
    }

    fn visit_map<M: MapAccess<'de>>(self, mut access: M) -> Result<KernelList, M::Error> {
        let mut list = KernelList::default();
        while let Some((major, vers)) = access.next_entry::<String, Vec<String>>()? {
            if list.majors.iter().any(|(m, _)| m == &major) {
                return Err(de::Error::custom(format!("duplicate major {:?}", &major)));
            }
            list.majors.push((major, vers));
        }
        Ok(list)
    }
}

impl<'de> Deserialize<'de> for KernelList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(KernelListVisitor)
    }
}

impl Serialize for KernelList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.majors.len()))?;
        for (major, vers) in self.majors.iter() {
            map.serialize_entry(major, vers)?;
        }
        map.end()
    }
}

impl JsonLoad for KernelList {}
