// 📐 Datamodel - Tables, fields and relationships of the collection domain
// The upload engine never guesses at structure: every table, field and
// relationship a plan may name is declared here.

use rusqlite::types::{FromSql, FromSqlResult, Null, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// FIELD VALUES
// ============================================================================

/// A typed cell value as it is filtered on and written to the store.
/// Dates are carried as ISO `YYYY-MM-DD` text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Boolean(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map(FieldValue::Integer).unwrap_or(FieldValue::Null)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Boolean(b) => write!(f, "{}", b),
            FieldValue::Integer(i) => write!(f, "{}", i),
            FieldValue::Real(r) => write!(f, "{}", r),
            FieldValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::from(Null),
            FieldValue::Boolean(b) => ToSqlOutput::from(*b),
            FieldValue::Integer(i) => ToSqlOutput::from(*i),
            FieldValue::Real(r) => ToSqlOutput::from(*r),
            FieldValue::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

impl FromSql for FieldValue {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(i) => FieldValue::Integer(i),
            ValueRef::Real(r) => FieldValue::Real(r),
            ValueRef::Text(_) | ValueRef::Blob(_) => FieldValue::Text(String::column_result(value)?),
        })
    }
}

/// Column name → value for one row of a table
pub type Record = BTreeMap<String, FieldValue>;

// ============================================================================
// FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    Latitude,
    Longitude,
    /// Enumerated agent type stored as an integer code
    AgentType,
}

impl FieldType {
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Text | FieldType::Date => "TEXT",
            FieldType::Integer | FieldType::Boolean | FieldType::AgentType => "INTEGER",
            FieldType::Decimal | FieldType::Latitude | FieldType::Longitude => "REAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    /// Maximum text length
    pub length: Option<usize>,
    /// Field written alongside this one: date precision, raw lat/long text
    pub companion: Option<&'static str>,
}

impl Field {
    const fn new(name: &'static str, field_type: FieldType) -> Self {
        Field {
            name,
            field_type,
            required: false,
            length: None,
            companion: None,
        }
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

const fn text(name: &'static str, length: usize) -> Field {
    let mut field = Field::new(name, FieldType::Text);
    field.length = Some(length);
    field
}

const fn integer(name: &'static str) -> Field {
    Field::new(name, FieldType::Integer)
}

const fn decimal(name: &'static str) -> Field {
    Field::new(name, FieldType::Decimal)
}

const fn boolean(name: &'static str) -> Field {
    Field::new(name, FieldType::Boolean)
}

const fn date(name: &'static str, precision: &'static str) -> Field {
    let mut field = Field::new(name, FieldType::Date);
    field.companion = Some(precision);
    field
}

const fn latitude(name: &'static str, raw_text: &'static str) -> Field {
    let mut field = Field::new(name, FieldType::Latitude);
    field.companion = Some(raw_text);
    field
}

const fn longitude(name: &'static str, raw_text: &'static str) -> Field {
    let mut field = Field::new(name, FieldType::Longitude);
    field.companion = Some(raw_text);
    field
}

const fn agent_type(name: &'static str) -> Field {
    Field::new(name, FieldType::AgentType)
}

// ============================================================================
// RELATIONSHIPS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    /// Foreign key on this table
    ManyToOne,
    /// Foreign key on this table; the related record is never shared
    OneToOne,
    /// Foreign key on the related table, pointing back here
    OneToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub name: &'static str,
    pub kind: RelationshipKind,
    pub related: &'static str,
    /// FK column: on this table for to-one, on `related` for to-many
    pub column: &'static str,
    pub required: bool,
}

impl Relationship {
    const fn new(
        name: &'static str,
        kind: RelationshipKind,
        related: &'static str,
        column: &'static str,
    ) -> Self {
        Relationship {
            name,
            kind,
            related,
            column,
            required: false,
        }
    }

    const fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn is_to_one(&self) -> bool {
        !matches!(self.kind, RelationshipKind::OneToMany)
    }
}

const fn many_to_one(name: &'static str, related: &'static str, column: &'static str) -> Relationship {
    Relationship::new(name, RelationshipKind::ManyToOne, related, column)
}

const fn one_to_one(name: &'static str, related: &'static str, column: &'static str) -> Relationship {
    Relationship::new(name, RelationshipKind::OneToOne, related, column)
}

const fn one_to_many(name: &'static str, related: &'static str, column: &'static str) -> Relationship {
    Relationship::new(name, RelationshipKind::OneToMany, related, column)
}

// ============================================================================
// TABLES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table {
    pub name: &'static str,
    pub id_field: &'static str,
    pub fields: &'static [Field],
    pub relationships: &'static [Relationship],
    /// Hierarchical table with parent/rank/node-number columns
    pub is_tree: bool,
}

impl Table {
    pub fn field(&self, name: &str) -> Option<&'static Field> {
        let name = name.to_lowercase();
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&'static Relationship> {
        let name = name.to_lowercase();
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Every column the table stores besides its id
    pub fn columns(&self) -> Vec<&'static str> {
        let mut columns: Vec<&'static str> = self.fields.iter().map(|f| f.name).collect();
        columns.extend(
            self.relationships
                .iter()
                .filter(|r| r.is_to_one())
                .map(|r| r.column),
        );
        columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns().iter().any(|c| *c == column)
    }
}

const AGENT: Table = Table {
    name: "agent",
    id_field: "agentid",
    fields: &[
        agent_type("agenttype").required(),
        text("firstname", 50),
        text("middleinitial", 50),
        text("lastname", 128),
        text("title", 50),
        text("email", 50),
        text("remarks", 4096),
        integer("divisionid"),
    ],
    relationships: &[],
    is_tree: false,
};

const COLLECTION_OBJECT: Table = Table {
    name: "collectionobject",
    id_field: "collectionobjectid",
    fields: &[
        text("catalognumber", 32),
        date("catalogeddate", "catalogeddateprecision"),
        integer("catalogeddateprecision"),
        text("fieldnumber", 50),
        text("text1", 4096),
        text("text2", 4096),
        integer("countamt"),
        boolean("yesno1"),
        text("remarks", 4096),
        integer("collectionid"),
        integer("collectionmemberid"),
    ],
    relationships: &[
        many_to_one("cataloger", "agent", "catalogerid"),
        many_to_one("collectingevent", "collectingevent", "collectingeventid"),
        one_to_one(
            "collectionobjectattribute",
            "collectionobjectattribute",
            "collectionobjectattributeid",
        ),
        one_to_many("determinations", "determination", "collectionobjectid"),
        one_to_many("preparations", "preparation", "collectionobjectid"),
    ],
    is_tree: false,
};

const COLLECTION_OBJECT_ATTRIBUTE: Table = Table {
    name: "collectionobjectattribute",
    id_field: "collectionobjectattributeid",
    fields: &[
        text("text1", 4096),
        text("text2", 4096),
        decimal("number1"),
        text("remarks", 4096),
        integer("collectionmemberid"),
    ],
    relationships: &[],
    is_tree: false,
};

const COLLECTING_EVENT: Table = Table {
    name: "collectingevent",
    id_field: "collectingeventid",
    fields: &[
        text("stationfieldnumber", 50),
        date("startdate", "startdateprecision"),
        integer("startdateprecision"),
        date("enddate", "enddateprecision"),
        integer("enddateprecision"),
        text("verbatimdate", 50),
        text("method", 50),
        text("remarks", 4096),
        integer("disciplineid"),
    ],
    relationships: &[
        many_to_one("locality", "locality", "localityid"),
        one_to_many("collectors", "collector", "collectingeventid"),
    ],
    is_tree: false,
};

const COLLECTOR: Table = Table {
    name: "collector",
    id_field: "collectorid",
    fields: &[
        integer("ordernumber"),
        boolean("isprimary"),
        text("remarks", 4096),
        integer("divisionid"),
    ],
    relationships: &[
        many_to_one("collectingevent", "collectingevent", "collectingeventid").required(),
        many_to_one("agent", "agent", "agentid").required(),
    ],
    is_tree: false,
};

const LOCALITY: Table = Table {
    name: "locality",
    id_field: "localityid",
    fields: &[
        text("localityname", 1024).required(),
        latitude("latitude1", "lat1text"),
        text("lat1text", 50),
        longitude("longitude1", "long1text"),
        text("long1text", 50),
        decimal("minelevation"),
        text("remarks", 4096),
        integer("disciplineid"),
    ],
    relationships: &[many_to_one("geography", "geography", "geographyid")],
    is_tree: false,
};

const GEOGRAPHY: Table = Table {
    name: "geography",
    id_field: "geographyid",
    fields: &[
        text("name", 128).required(),
        text("fullname", 500),
        text("commonname", 128),
        text("abbrev", 16),
        integer("rankid"),
        boolean("isaccepted"),
        integer("nodenumber"),
        integer("highestchildnodenumber"),
        integer("treedefid"),
        integer("treedefitemid"),
    ],
    relationships: &[
        many_to_one("parent", "geography", "parentid"),
        many_to_one("accepted", "geography", "acceptedid"),
    ],
    is_tree: true,
};

const TAXON: Table = Table {
    name: "taxon",
    id_field: "taxonid",
    fields: &[
        text("name", 256).required(),
        text("author", 128),
        text("fullname", 500),
        text("commonname", 128),
        integer("rankid"),
        boolean("isaccepted"),
        integer("nodenumber"),
        integer("highestchildnodenumber"),
        integer("treedefid"),
        integer("treedefitemid"),
    ],
    relationships: &[
        many_to_one("parent", "taxon", "parentid"),
        many_to_one("accepted", "taxon", "acceptedid"),
    ],
    is_tree: true,
};

const DETERMINATION: Table = Table {
    name: "determination",
    id_field: "determinationid",
    fields: &[
        date("determineddate", "determineddateprecision"),
        integer("determineddateprecision"),
        boolean("iscurrent"),
        text("typestatusname", 50),
        text("qualifier", 16),
        text("remarks", 4096),
        integer("collectionmemberid"),
    ],
    relationships: &[
        many_to_one("collectionobject", "collectionobject", "collectionobjectid").required(),
        many_to_one("taxon", "taxon", "taxonid"),
        many_to_one("determiner", "agent", "determinerid"),
    ],
    is_tree: false,
};

const PREPARATION: Table = Table {
    name: "preparation",
    id_field: "preparationid",
    fields: &[
        integer("countamt"),
        text("description", 255),
        text("remarks", 4096),
        integer("collectionmemberid"),
    ],
    relationships: &[
        many_to_one("collectionobject", "collectionobject", "collectionobjectid").required(),
        many_to_one("preptype", "preptype", "preptypeid").required(),
    ],
    is_tree: false,
};

const PREP_TYPE: Table = Table {
    name: "preptype",
    id_field: "preptypeid",
    fields: &[
        text("name", 64).required(),
        boolean("isloanable"),
        integer("collectionid"),
    ],
    relationships: &[],
    is_tree: false,
};

/// Tables in dependency order: referenced tables come first
static COLLECTION_TABLES: &[Table] = &[
    AGENT,
    GEOGRAPHY,
    TAXON,
    LOCALITY,
    COLLECTING_EVENT,
    COLLECTOR,
    COLLECTION_OBJECT_ATTRIBUTE,
    COLLECTION_OBJECT,
    PREP_TYPE,
    DETERMINATION,
    PREPARATION,
];

// ============================================================================
// DATAMODEL
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct Datamodel {
    tables: &'static [Table],
}

impl Datamodel {
    /// The specimen / event / locality / tree / agent domain
    pub fn collection_domain() -> Self {
        Datamodel {
            tables: COLLECTION_TABLES,
        }
    }

    pub fn tables(&self) -> &'static [Table] {
        self.tables
    }

    pub fn table(&self, name: &str) -> Option<&'static Table> {
        let name = name.to_lowercase();
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables whose match predicates look at rows of `table` through a
    /// to-many relationship.
    pub fn to_many_parents(&self, table: &str) -> Vec<&'static str> {
        self.tables
            .iter()
            .filter(|t| {
                t.relationships.iter().any(|r| {
                    r.kind == RelationshipKind::OneToMany && r.related == table
                })
            })
            .map(|t| t.name)
            .collect()
    }
}

impl Default for Datamodel {
    fn default() -> Self {
        Self::collection_domain()
    }
}

// ============================================================================
// TESTS
// ============================================================================
