/// Wire-level parameter: libpq text form, `None` for SQL NULL.
pub type WireParam = Option<String>;

/// Execution flags carried by a [`Query`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// Transparently upgrade a parameterized query to a cached server-side
    /// prepared statement.
    pub cache_plan: bool,
    /// Request binary result format from the server.
    pub binary: bool,
}

impl QueryFlags {
    #[must_use]
    pub const fn new() -> Self {
        QueryFlags {
            cache_plan: false,
            binary: false,
        }
    }

    #[must_use]
    pub const fn cache_plan(mut self) -> Self {
        self.cache_plan = true;
        self
    }

    #[must_use]
    pub const fn binary(mut self) -> Self {
        self.binary = true;
        self
    }
}

/// The shape of a single SQL command travelling through the pipeline.
#[derive(Debug)]
pub enum QueryKind {
    /// Execute an SQL command, without any parameters.
    Raw { sql: String },
    /// Execute an ad hoc SQL command, with parameters.
    Parameterized { sql: String, params: Vec<WireParam> },
    /// Prepare a statement for later execution.
    Prepare {
        statement: String,
        sql: String,
        num_params: usize,
    },
    /// Execute a previously prepared statement, with parameters.
    Prepared {
        statement: String,
        params: Vec<WireParam>,
    },
}

/// Immutable query descriptor. Non-copyable; moved through the pipeline from
/// the enqueue path to the connection that finally sends it.
#[derive(Debug)]
pub struct Query {
    kind: QueryKind,
    flags: QueryFlags,
}

impl Query {
    #[must_use]
    pub fn raw(sql: impl Into<String>) -> Self {
        Query {
            kind: QueryKind::Raw { sql: sql.into() },
            flags: QueryFlags::default(),
        }
    }

    #[must_use]
    pub fn parameterized(sql: impl Into<String>, params: Vec<WireParam>) -> Self {
        Query {
            kind: QueryKind::Parameterized {
                sql: sql.into(),
                params,
            },
            flags: QueryFlags::default(),
        }
    }

    #[must_use]
    pub fn prepare(
        statement: impl Into<String>,
        sql: impl Into<String>,
        num_params: usize,
    ) -> Self {
        Query {
            kind: QueryKind::Prepare {
                statement: statement.into(),
                sql: sql.into(),
                num_params,
            },
            flags: QueryFlags::default(),
        }
    }

    #[must_use]
    pub fn prepared(statement: impl Into<String>, params: Vec<WireParam>) -> Self {
        Query {
            kind: QueryKind::Prepared {
                statement: statement.into(),
                params,
            },
            flags: QueryFlags::default(),
        }
    }

    pub(crate) fn from_parts(kind: QueryKind, flags: QueryFlags) -> Self {
        Query { kind, flags }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    #[must_use]
    pub fn into_kind(self) -> QueryKind {
        self.kind
    }

    #[must_use]
    pub fn flags(&self) -> QueryFlags {
        self.flags
    }

    /// SQL text for the variants that carry one.
    #[must_use]
    pub fn sql(&self) -> Option<&str> {
        match &self.kind {
            QueryKind::Raw { sql }
            | QueryKind::Parameterized { sql, .. }
            | QueryKind::Prepare { sql, .. } => Some(sql),
            QueryKind::Prepared { .. } => None,
        }
    }
}
