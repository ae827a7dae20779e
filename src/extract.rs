//! Extracción de texto plano a partir de los bytes de un fichero subido.
//!
//! El despacho depende sólo de la extensión del nombre (sin distinguir
//! mayúsculas): PDF, DOCX o TXT. Cualquier otra extensión se rechaza.

use docx_rs::{
    DocumentChild, InsertChild, ParagraphChild, Run, RunChild, StructuredDataTagChild,
    TableCellContent, TableChild, TableRowChild,
};

use crate::error::{Error, Result};

/// MIME aceptados en la subida, en el mismo orden que [`FileKind`].
pub const ACCEPTED_MIME_TYPES: [&str; 3] = [
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Docx,
    Txt,
}

impl FileKind {
    pub fn from_file_name(file_name: &str) -> Result<Self> {
        let extension = file_extension(file_name);
        match extension.as_str() {
            "pdf" => Ok(Self::Pdf),
            "docx" => Ok(Self::Docx),
            "txt" => Ok(Self::Txt),
            _ => Err(Error::UnsupportedFileType(extension)),
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => ACCEPTED_MIME_TYPES[0],
            Self::Docx => ACCEPTED_MIME_TYPES[1],
            Self::Txt => ACCEPTED_MIME_TYPES[2],
        }
    }
}

fn file_extension(file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => String::new(),
    }
}

/// Convierte el fichero en texto plano según su extensión.
pub fn extract_text(bytes: &[u8], file_name: &str) -> Result<String> {
    match FileKind::from_file_name(file_name)? {
        FileKind::Pdf => extract_pdf(bytes, file_name),
        FileKind::Docx => extract_docx(bytes, file_name),
        FileKind::Txt => String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::extraction(file_name, e)),
    }
}

/// Texto de cada página, en orden, separado por un salto de línea.
fn extract_pdf(bytes: &[u8], file_name: &str) -> Result<String> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| Error::extraction(file_name, e))?;
    Ok(pages.join("\n"))
}

fn extract_docx(bytes: &[u8], file_name: &str) -> Result<String> {
    let docx = docx_rs::read_docx(bytes).map_err(|e| Error::extraction(file_name, e))?;

    let mut lines = Vec::new();
    for child in &docx.document.children {
        match child {
            DocumentChild::Paragraph(p) => lines.push(paragraph_text(&p.children)),
            DocumentChild::Table(table) => {
                for TableChild::TableRow(row) in &table.rows {
                    for TableRowChild::TableCell(cell) in &row.cells {
                        for content in &cell.children {
                            if let TableCellContent::Paragraph(p) = content {
                                lines.push(paragraph_text(&p.children));
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(lines.join("\n"))
}

fn paragraph_text(children: &[ParagraphChild]) -> String {
    let mut text = String::new();
    push_paragraph_children(children, &mut text);
    text
}

/// Texto visible del párrafo, incluidos hipervínculos, inserciones
/// con control de cambios y controles de contenido.
fn push_paragraph_children(children: &[ParagraphChild], text: &mut String) {
    for child in children {
        match child {
            ParagraphChild::Run(run) => push_run(run, text),
            ParagraphChild::Hyperlink(link) => push_paragraph_children(&link.children, text),
            ParagraphChild::Insert(insert) => {
                for insert_child in &insert.children {
                    if let InsertChild::Run(run) = insert_child {
                        push_run(run, text);
                    }
                }
            }
            ParagraphChild::StructuredDataTag(tag) => push_tag_children(&tag.children, text),
            _ => {}
        }
    }
}

fn push_tag_children(children: &[StructuredDataTagChild], text: &mut String) {
    for child in children {
        match child {
            StructuredDataTagChild::Run(run) => push_run(run, text),
            StructuredDataTagChild::Paragraph(p) => push_paragraph_children(&p.children, text),
            StructuredDataTagChild::StructuredDataTag(tag) => push_tag_children(&tag.children, text),
            _ => {}
        }
    }
}

fn push_run(run: &Run, text: &mut String) {
    for run_child in &run.children {
        match run_child {
            RunChild::Text(t) => text.push_str(&t.text),
            RunChild::Tab(_) => text.push('\t'),
            _ => {}
        }
    }
}
