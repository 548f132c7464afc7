//! Adapter implementing [`git_pack::index_pack::ObjectSource`] over an
//! [`ObjectDatabase`], so the indexer can fetch thin-pack bases, run
//! structural checks, and publish through the same store used for reads.

use std::path::Path;

use git_hash::ObjectId;
use git_object::{Object, ObjectType};
use git_pack::index_pack::ObjectSource;
use git_pack::PackError;

use crate::ObjectDatabase;

impl ObjectSource for ObjectDatabase {
    fn open_by_id(&self, oid: &ObjectId) -> Result<Option<(ObjectType, Vec<u8>)>, PackError> {
        match self.read(oid) {
            Ok(Some(obj)) => Ok(Some((obj.object_type(), obj.serialize_content()))),
            Ok(None) => Ok(None),
            Err(e) => Err(pack_error(e)),
        }
    }

    fn check_object(&self, obj_type: ObjectType, data: &[u8]) -> Result<(), PackError> {
        Object::parse_content(obj_type, data).map(|_| ()).map_err(PackError::from)
    }

    fn open_pack(&self, pack_path: &Path, index_path: &Path) -> Result<(), PackError> {
        let _ = (pack_path, index_path);
        self.refresh().map_err(pack_error)
    }
}

fn pack_error(e: crate::OdbError) -> PackError {
    match e {
        crate::OdbError::Pack(inner) => inner,
        crate::OdbError::Io(inner) => PackError::Io(inner),
        other => PackError::Publish(other.to_string()),
    }
}
