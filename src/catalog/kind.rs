use crate::authorization::privilege::{MetadataObjectType, PrivilegeName};
use crate::meta::EntityType;

/// Compile-time description of one kind of object served by catalog connectors.
pub trait ObjectKind: Send + Sync + 'static {
    const ENTITY_TYPE: EntityType;
    const OBJECT_TYPE: MetadataObjectType;
    /// Type of the object that owns this kind's namespace.
    const PARENT_TYPE: MetadataObjectType;

    /// Checked on the parent before a create.
    const CREATE: PrivilegeName;
    const READ: PrivilegeName;
    const ALTER: PrivilegeName;
    const DROP: PrivilegeName;
}

pub struct SchemaKind;

impl ObjectKind for SchemaKind {
    const ENTITY_TYPE: EntityType = EntityType::Schema;
    const OBJECT_TYPE: MetadataObjectType = MetadataObjectType::Schema;
    const PARENT_TYPE: MetadataObjectType = MetadataObjectType::Catalog;
    const CREATE: PrivilegeName = PrivilegeName::CreateSchema;
    const READ: PrivilegeName = PrivilegeName::UseSchema;
    const ALTER: PrivilegeName = PrivilegeName::AlterSchema;
    const DROP: PrivilegeName = PrivilegeName::DropSchema;
}

pub struct TableKind;

impl ObjectKind for TableKind {
    const ENTITY_TYPE: EntityType = EntityType::Table;
    const OBJECT_TYPE: MetadataObjectType = MetadataObjectType::Table;
    const PARENT_TYPE: MetadataObjectType = MetadataObjectType::Schema;
    const CREATE: PrivilegeName = PrivilegeName::CreateTable;
    const READ: PrivilegeName = PrivilegeName::ReadTable;
    const ALTER: PrivilegeName = PrivilegeName::WriteTable;
    const DROP: PrivilegeName = PrivilegeName::DropTable;
}

pub struct TopicKind;

impl ObjectKind for TopicKind {
    const ENTITY_TYPE: EntityType = EntityType::Topic;
    const OBJECT_TYPE: MetadataObjectType = MetadataObjectType::Topic;
    const PARENT_TYPE: MetadataObjectType = MetadataObjectType::Schema;
    const CREATE: PrivilegeName = PrivilegeName::CreateTopic;
    const READ: PrivilegeName = PrivilegeName::ReadTopic;
    const ALTER: PrivilegeName = PrivilegeName::WriteTopic;
    const DROP: PrivilegeName = PrivilegeName::DropTopic;
}

pub struct FilesetKind;

impl ObjectKind for FilesetKind {
    const ENTITY_TYPE: EntityType = EntityType::Fileset;
    const OBJECT_TYPE: MetadataObjectType = MetadataObjectType::Fileset;
    const PARENT_TYPE: MetadataObjectType = MetadataObjectType::Schema;
    const CREATE: PrivilegeName = PrivilegeName::CreateFileset;
    const READ: PrivilegeName = PrivilegeName::ReadFileset;
    const ALTER: PrivilegeName = PrivilegeName::WriteFileset;
    const DROP: PrivilegeName = PrivilegeName::DropFileset;
}
