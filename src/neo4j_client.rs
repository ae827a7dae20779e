use crate::config::AppConfig;
use crate::vector_store::CHUNK_INDEX_NAME;
use anyhow::Result;
use neo4rs::{query, Graph};
use tracing::info;
use url::Url;

pub async fn connect_from_config(cfg: &AppConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea los constraints de :User, :Document, :Chat y :Chunk y el índice
/// vectorial sobre `:Chunk(embedding)` con la dimensión configurada.
pub async fn ensure_schema(graph: &Graph, dimensions: usize) -> Result<()> {
    let statements = [
        // User.email único (clave de sincronización con el proveedor de identidad)
        "CREATE CONSTRAINT user_email IF NOT EXISTS
         FOR (u:User)
         REQUIRE u.email IS UNIQUE",
        "CREATE CONSTRAINT doc_id IF NOT EXISTS
         FOR (d:Document)
         REQUIRE d.id IS UNIQUE",
        "CREATE CONSTRAINT chat_id IF NOT EXISTS
         FOR (c:Chat)
         REQUIRE c.id IS UNIQUE",
        // Un id de vector es único dentro de su espacio de nombres
        "CREATE CONSTRAINT chunk_namespace_id IF NOT EXISTS
         FOR (c:Chunk)
         REQUIRE (c.namespace, c.id) IS UNIQUE",
        // Búsqueda vectorial acotada a espacio y documento
        "CREATE INDEX chunk_scope IF NOT EXISTS
         FOR (c:Chunk) ON (c.namespace, c.document_id)",
        "CREATE INDEX doc_user IF NOT EXISTS
         FOR (d:Document) ON (d.user_id)",
        "CREATE INDEX chat_conversation IF NOT EXISTS
         FOR (c:Chat) ON (c.conversation_id)",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", CHUNK_INDEX_NAME),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{CHUNK_INDEX_NAME}' ya existe.");
    } else {
        let cypher = format!(
            "\
CREATE VECTOR INDEX {CHUNK_INDEX_NAME}
FOR (c:Chunk)
ON (c.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}"
        );
        graph.run(query(&cypher)).await?;
        info!("Índice vectorial '{CHUNK_INDEX_NAME}' creado ({dimensions} dimensiones).");
    }

    info!("Esquema de Neo4j asegurado.");
    Ok(())
}
