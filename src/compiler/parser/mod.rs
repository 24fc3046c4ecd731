//! Syntactic Analysis
//!
//! Recursive-descent parser with a precedence-climbing expression core.
//! `import a.b;` declarations are resolved against the import search path and
//! parsed once per compilation; their declarations merge into the unit.
//!
//! On an unexpected token the parser reports a positioned error, then skips
//! to the next `;` or `}` so further errors in the same file still surface.
//! The unit fails to compile if any error was recorded.

pub mod ast;

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::compiler::lexer::{self, Keyword, Punct, Token, TokenKind};
use crate::error::{Diagnostics, Error, Pos, Result};
use ast::{
    Ast, BinaryOp, Block, BlockItem, CompositeDef, ConstDef, Declaration, EntityArena, Expr,
    ExprKind, FunctionDecl, FunctionDef, Member, Param, Stmt, TypeRef, TypeRefKind, TypedefDef,
    UnaryOp, VarDecl, VarDef,
};

/// Locates and tracks imported units for one compilation, so each file is
/// parsed at most once and import cycles terminate.
#[derive(Debug)]
pub struct Importer {
    search_paths: Vec<PathBuf>,
    loading: HashSet<PathBuf>,
}

impl Importer {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self {
            search_paths,
            loading: HashSet::new(),
        }
    }

    /// Resolves `a.b.c` to the first `a/b/c.hb` found on the search path.
    fn locate(&self, name: &str) -> Option<PathBuf> {
        let rel = PathBuf::from(name.replace('.', "/")).with_extension("hb");
        self.search_paths
            .iter()
            .map(|dir| dir.join(&rel))
            .find(|candidate| candidate.exists())
    }
}

/// Parses one source file into an AST, resolving imports through `importer`.
pub fn parse_file(
    path: &'static Path,
    importer: &mut Importer,
    diag: &mut Diagnostics,
) -> Result<Ast> {
    let src = fs::read(path)
        .map_err(|err| Error::File(format!("cannot read {}: {err}", path.display())))?;

    let tokens = lexer::tokenize(path, &src, diag)?;

    let mark = diag.error_count();
    let mut parser = Parser::new(&tokens, diag);
    let decls = parser.parse_unit(importer);
    parser.diag.checkpoint(mark, Error::Syntax)?;

    Ok(Ast {
        decls,
        tokens,
        entities: EntityArena::new(),
    })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    /// Typedef names seen so far; needed to tell a declaration from an
    /// expression statement.
    typedefs: HashSet<String>,
    diag: &'a mut Diagnostics,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token], diag: &'a mut Diagnostics) -> Self {
        Self {
            tokens,
            pos: 0,
            typedefs: HashSet::new(),
            diag,
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)]
    }

    fn pos_here(&self) -> Pos {
        self.peek().pos
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if !self.at_eof() {
            self.pos += 1;
        }
        token
    }

    fn at_punct(&self, p: Punct) -> bool {
        self.peek().kind == TokenKind::Punct(p)
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        self.peek().kind == TokenKind::Keyword(kw)
    }

    /// Consumes the current token if it is the given punctuation.
    fn accept_punct(&mut self, p: Punct) -> bool {
        if self.at_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn accept_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error_here(&mut self, msg: impl std::fmt::Display) -> Error {
        let pos = self.pos_here();
        self.diag.error(pos, msg);
        Error::Syntax
    }

    fn expect_punct(&mut self, p: Punct) -> Result<()> {
        if self.accept_punct(p) {
            Ok(())
        } else {
            let found = self.peek().kind.clone();
            Err(self.error_here(format!("expected '{}', but found '{found}'", p.as_str())))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<()> {
        if self.accept_keyword(kw) {
            Ok(())
        } else {
            let found = self.peek().kind.clone();
            Err(self.error_here(format!("expected '{}', but found '{found}'", kw.as_str())))
        }
    }

    fn expect_ident(&mut self) -> Result<(String, Pos)> {
        match &self.peek().kind {
            TokenKind::Ident(name) => {
                let name = name.clone();
                let pos = self.pos_here();
                self.pos += 1;
                Ok((name, pos))
            }
            found => {
                let found = found.clone();
                Err(self.error_here(format!("expected identifier, but found '{found}'")))
            }
        }
    }

    /// Skips ahead to the token after the next `;`, or to a `}`, so parsing
    /// can continue after an error.
    fn synchronize(&mut self) {
        while !self.at_eof() {
            if self.accept_punct(Punct::Semicolon) {
                return;
            }
            if self.at_punct(Punct::RBrace) {
                return;
            }
            self.pos += 1;
        }
    }

    /// Does the current token begin a type?
    fn at_type_start(&self) -> bool {
        match &self.peek().kind {
            TokenKind::Keyword(
                Keyword::Void
                | Keyword::Char
                | Keyword::Short
                | Keyword::Int
                | Keyword::Long
                | Keyword::Unsigned
                | Keyword::Signed
                | Keyword::Struct
                | Keyword::Union,
            ) => true,
            TokenKind::Ident(name) => self.typedefs.contains(name),
            _ => false,
        }
    }

    fn at_decl_start(&self) -> bool {
        self.at_keyword(Keyword::Static) || self.at_type_start()
    }

    // ----- declarations -------------------------------------------------

    fn parse_unit(&mut self, importer: &mut Importer) -> Vec<Declaration> {
        let mut decls = vec![];

        while !self.at_eof() {
            if self.at_keyword(Keyword::Import) {
                match self.parse_import(importer) {
                    Ok(mut imported) => {
                        for decl in &imported {
                            if let Declaration::TypeDef(def) = decl {
                                self.typedefs.insert(def.name.clone());
                            }
                        }
                        decls.append(&mut imported);
                    }
                    Err(_) => self.recover_toplevel(),
                }
                continue;
            }

            match self.parse_toplevel() {
                Ok(decl) => {
                    if let Declaration::TypeDef(def) = &decl {
                        self.typedefs.insert(def.name.clone());
                    }
                    decls.push(decl);
                }
                Err(_) => self.recover_toplevel(),
            }
        }

        decls
    }

    /// Top-level recovery: a `}` that stopped synchronization has no block
    /// to close here, so it is consumed to guarantee progress.
    fn recover_toplevel(&mut self) {
        self.synchronize();
        if self.at_punct(Punct::RBrace) {
            self.pos += 1;
        }
    }

    fn parse_import(&mut self, importer: &mut Importer) -> Result<Vec<Declaration>> {
        self.expect_keyword(Keyword::Import)?;
        let pos = self.pos_here();

        let (first, _) = self.expect_ident()?;
        let mut name = first;
        while self.accept_punct(Punct::Dot) {
            let (segment, _) = self.expect_ident()?;
            name.push('.');
            name.push_str(&segment);
        }
        self.expect_punct(Punct::Semicolon)?;

        let Some(path) = importer.locate(&name) else {
            self.diag.error(pos, format!("cannot find import: {name}"));
            return Err(Error::Syntax);
        };

        let canonical = path.canonicalize().unwrap_or(path.clone());
        if !importer.loading.insert(canonical) {
            // Already loaded or currently loading: cycles and duplicate
            // imports are skipped on reentry.
            return Ok(vec![]);
        }

        debug!("importing {}", path.display());

        let leaked: &'static Path = Box::leak(path.into_boxed_path());
        let src = fs::read(leaked).map_err(|err| {
            self.diag
                .error(pos, format!("cannot read {}: {err}", leaked.display()));
            Error::File(format!("cannot read {}", leaked.display()))
        })?;

        let tokens = lexer::tokenize(leaked, &src, self.diag)?;
        let mut nested = Parser::new(&tokens, &mut *self.diag);
        let decls = nested.parse_unit(importer);

        Ok(decls)
    }

    fn parse_toplevel(&mut self) -> Result<Declaration> {
        match &self.peek().kind {
            TokenKind::Keyword(Keyword::Typedef) => self.parse_typedef(),
            TokenKind::Keyword(Keyword::Const) => self.parse_const(),
            TokenKind::Keyword(Keyword::Extern) => self.parse_extern(),
            TokenKind::Keyword(Keyword::Struct)
                if matches!(self.peek_at(1).kind, TokenKind::Ident(_))
                    && self.peek_at(2).kind == TokenKind::Punct(Punct::LBrace) =>
            {
                self.parse_composite(true)
            }
            TokenKind::Keyword(Keyword::Union)
                if matches!(self.peek_at(1).kind, TokenKind::Ident(_))
                    && self.peek_at(2).kind == TokenKind::Punct(Punct::LBrace) =>
            {
                self.parse_composite(false)
            }
            _ => self.parse_function_or_variable(),
        }
    }

    fn parse_typedef(&mut self) -> Result<Declaration> {
        self.expect_keyword(Keyword::Typedef)?;
        let ty = self.parse_type()?;
        let (name, pos) = self.expect_ident()?;
        let ty = self.parse_array_suffixes(ty)?;
        self.expect_punct(Punct::Semicolon)?;

        Ok(Declaration::TypeDef(TypedefDef { name, pos, ty }))
    }

    fn parse_const(&mut self) -> Result<Declaration> {
        self.expect_keyword(Keyword::Const)?;
        let ty = self.parse_type()?;
        let (name, pos) = self.expect_ident()?;
        self.expect_punct(Punct::Assign)?;
        let value = self.parse_assign_expr()?;
        self.expect_punct(Punct::Semicolon)?;

        Ok(Declaration::Constant(ConstDef {
            name,
            pos,
            ty,
            value,
            entity: None,
        }))
    }

    fn parse_extern(&mut self) -> Result<Declaration> {
        self.expect_keyword(Keyword::Extern)?;
        let ty = self.parse_type()?;
        let (name, pos) = self.expect_ident()?;

        if self.at_punct(Punct::LParen) {
            let (params, variadic) = self.parse_params()?;
            self.expect_punct(Punct::Semicolon)?;
            return Ok(Declaration::UndefinedFunction(FunctionDecl {
                name,
                pos,
                ret: ty,
                params,
                variadic,
                entity: None,
            }));
        }

        let ty = self.parse_array_suffixes(ty)?;
        self.expect_punct(Punct::Semicolon)?;

        Ok(Declaration::UndefinedVariable(VarDecl {
            name,
            pos,
            ty,
            entity: None,
        }))
    }

    fn parse_composite(&mut self, is_struct: bool) -> Result<Declaration> {
        self.advance();
        let (name, pos) = self.expect_ident()?;
        self.expect_punct(Punct::LBrace)?;

        let mut members = vec![];
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            let ty = self.parse_type()?;
            let (m_name, m_pos) = self.expect_ident()?;
            let ty = self.parse_array_suffixes(ty)?;
            self.expect_punct(Punct::Semicolon)?;
            members.push(Member {
                name: m_name,
                pos: m_pos,
                ty,
            });
        }

        self.expect_punct(Punct::RBrace)?;
        self.expect_punct(Punct::Semicolon)?;

        let def = CompositeDef { name, pos, members };
        Ok(if is_struct {
            Declaration::StructDef(def)
        } else {
            Declaration::UnionDef(def)
        })
    }

    fn parse_function_or_variable(&mut self) -> Result<Declaration> {
        let is_static = self.accept_keyword(Keyword::Static);
        let ty = self.parse_type()?;
        let (name, pos) = self.expect_ident()?;

        if self.at_punct(Punct::LParen) {
            let (params, variadic) = self.parse_params()?;

            if self.accept_punct(Punct::Semicolon) {
                return Ok(Declaration::UndefinedFunction(FunctionDecl {
                    name,
                    pos,
                    ret: ty,
                    params,
                    variadic,
                    entity: None,
                }));
            }

            let body = self.parse_block()?;
            return Ok(Declaration::DefinedFunction(FunctionDef {
                name,
                pos,
                is_static,
                ret: ty,
                params,
                variadic,
                body,
                entity: None,
            }));
        }

        let ty = self.parse_array_suffixes(ty)?;
        let init = if self.accept_punct(Punct::Assign) {
            Some(self.parse_assign_expr()?)
        } else {
            None
        };
        self.expect_punct(Punct::Semicolon)?;

        Ok(Declaration::DefinedVariable(VarDef {
            name,
            pos,
            is_static,
            ty,
            init,
            entity: None,
        }))
    }

    fn parse_params(&mut self) -> Result<(Vec<Param>, bool)> {
        self.expect_punct(Punct::LParen)?;

        // `(void)` and `()` both declare an empty parameter list.
        if self.at_keyword(Keyword::Void)
            && self.peek_at(1).kind == TokenKind::Punct(Punct::RParen)
        {
            self.pos += 2;
            return Ok((vec![], false));
        }
        if self.accept_punct(Punct::RParen) {
            return Ok((vec![], false));
        }

        let mut params = vec![];
        let mut variadic = false;

        loop {
            if self.accept_punct(Punct::Ellipsis) {
                variadic = true;
                break;
            }

            let ty = self.parse_type()?;
            let (name, p_pos) = match &self.peek().kind {
                TokenKind::Ident(_) => self.expect_ident()?,
                // Unnamed prototype parameter.
                _ => (String::new(), self.pos_here()),
            };

            params.push(Param {
                name,
                pos: p_pos,
                ty,
                entity: None,
            });

            if !self.accept_punct(Punct::Comma) {
                break;
            }
        }

        self.expect_punct(Punct::RParen)?;
        Ok((params, variadic))
    }

    /// Parses a base type followed by any number of `*`.
    fn parse_type(&mut self) -> Result<TypeRef> {
        let pos = self.pos_here();

        let kind = match self.peek().kind.clone() {
            TokenKind::Keyword(Keyword::Void) => {
                self.pos += 1;
                TypeRefKind::Void
            }
            TokenKind::Keyword(Keyword::Char) => {
                self.pos += 1;
                TypeRefKind::Char
            }
            TokenKind::Keyword(Keyword::Short) => {
                self.pos += 1;
                TypeRefKind::Short
            }
            TokenKind::Keyword(Keyword::Int) => {
                self.pos += 1;
                TypeRefKind::Int
            }
            TokenKind::Keyword(Keyword::Long) => {
                self.pos += 1;
                TypeRefKind::Long
            }
            TokenKind::Keyword(Keyword::Unsigned) => {
                self.pos += 1;
                match self.peek().kind {
                    TokenKind::Keyword(Keyword::Char) => {
                        self.pos += 1;
                        TypeRefKind::UChar
                    }
                    TokenKind::Keyword(Keyword::Short) => {
                        self.pos += 1;
                        TypeRefKind::UShort
                    }
                    TokenKind::Keyword(Keyword::Long) => {
                        self.pos += 1;
                        TypeRefKind::ULong
                    }
                    TokenKind::Keyword(Keyword::Int) => {
                        self.pos += 1;
                        TypeRefKind::UInt
                    }
                    _ => TypeRefKind::UInt,
                }
            }
            TokenKind::Keyword(Keyword::Signed) => {
                self.pos += 1;
                match self.peek().kind {
                    TokenKind::Keyword(Keyword::Char) => {
                        self.pos += 1;
                        TypeRefKind::Char
                    }
                    TokenKind::Keyword(Keyword::Short) => {
                        self.pos += 1;
                        TypeRefKind::Short
                    }
                    TokenKind::Keyword(Keyword::Long) => {
                        self.pos += 1;
                        TypeRefKind::Long
                    }
                    TokenKind::Keyword(Keyword::Int) => {
                        self.pos += 1;
                        TypeRefKind::Int
                    }
                    _ => TypeRefKind::Int,
                }
            }
            TokenKind::Keyword(Keyword::Struct) => {
                self.pos += 1;
                let (name, _) = self.expect_ident()?;
                TypeRefKind::Struct(name)
            }
            TokenKind::Keyword(Keyword::Union) => {
                self.pos += 1;
                let (name, _) = self.expect_ident()?;
                TypeRefKind::Union(name)
            }
            TokenKind::Ident(name) if self.typedefs.contains(&name) => {
                self.pos += 1;
                TypeRefKind::Named(name)
            }
            found => {
                return Err(self.error_here(format!("expected type name, but found '{found}'")));
            }
        };

        let mut ty = TypeRef::new(kind, pos);
        while self.accept_punct(Punct::Star) {
            ty = TypeRef::new(TypeRefKind::Pointer(Box::new(ty)), pos);
        }

        Ok(ty)
    }

    /// Wraps `ty` in array types for each `[len]` declarator suffix.
    ///
    /// Suffixes apply outermost-first: `int a[2][3]` is two arrays of three
    /// ints.
    fn parse_array_suffixes(&mut self, ty: TypeRef) -> Result<TypeRef> {
        if !self.at_punct(Punct::LBracket) {
            return Ok(ty);
        }

        let pos = self.pos_here();
        self.pos += 1;

        let len = match self.peek().kind {
            TokenKind::Int { value, .. } => {
                if value <= 0 {
                    return Err(self.error_here("array length must be positive"));
                }
                self.pos += 1;
                value as u32
            }
            _ => return Err(self.error_here("expected integer array length")),
        };
        self.expect_punct(Punct::RBracket)?;

        let inner = self.parse_array_suffixes(ty)?;

        Ok(TypeRef::new(
            TypeRefKind::Array(Box::new(inner), len),
            pos,
        ))
    }

    // ----- statements ---------------------------------------------------

    fn parse_block(&mut self) -> Result<Block> {
        self.expect_punct(Punct::LBrace)?;

        let mut items = vec![];
        while !self.at_punct(Punct::RBrace) && !self.at_eof() {
            match self.parse_block_item() {
                Ok(item) => items.push(item),
                Err(_) => {
                    self.synchronize();
                    // A closing brace after recovery ends this block.
                    if self.at_punct(Punct::RBrace) {
                        break;
                    }
                }
            }
        }

        self.expect_punct(Punct::RBrace)?;
        Ok(Block { items })
    }

    fn parse_block_item(&mut self) -> Result<BlockItem> {
        if self.at_decl_start() {
            Ok(BlockItem::Decl(self.parse_local_decl()?))
        } else {
            Ok(BlockItem::Stmt(self.parse_statement()?))
        }
    }

    fn parse_local_decl(&mut self) -> Result<VarDef> {
        let is_static = self.accept_keyword(Keyword::Static);
        let ty = self.parse_type()?;
        let (name, pos) = self.expect_ident()?;
        let ty = self.parse_array_suffixes(ty)?;

        let init = if self.accept_punct(Punct::Assign) {
            Some(self.parse_assign_expr()?)
        } else {
            None
        };
        self.expect_punct(Punct::Semicolon)?;

        Ok(VarDef {
            name,
            pos,
            is_static,
            ty,
            init,
            entity: None,
        })
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        let pos = self.pos_here();

        match &self.peek().kind {
            TokenKind::Keyword(Keyword::Return) => {
                self.pos += 1;
                let expr = if self.at_punct(Punct::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Return { expr, pos })
            }
            TokenKind::Keyword(Keyword::If) => {
                self.pos += 1;
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                let then = Box::new(self.parse_statement()?);

                let otherwise = if self.accept_keyword(Keyword::Else) {
                    Some(Box::new(self.parse_statement()?))
                } else {
                    None
                };

                Ok(Stmt::If {
                    cond,
                    then,
                    otherwise,
                })
            }
            TokenKind::Keyword(Keyword::While) => {
                self.pos += 1;
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                let body = Box::new(self.parse_statement()?);

                Ok(Stmt::While {
                    cond,
                    body,
                    // Backpatched by the jump resolver.
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::Do) => {
                self.pos += 1;
                let body = Box::new(self.parse_statement()?);
                self.expect_keyword(Keyword::While)?;
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                self.expect_punct(Punct::Semicolon)?;

                Ok(Stmt::DoWhile {
                    body,
                    cond,
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::For) => {
                self.pos += 1;
                self.expect_punct(Punct::LParen)?;

                let mut init = None;
                let mut init_decl = None;
                if self.at_decl_start() {
                    init_decl = Some(Box::new(self.parse_local_decl()?));
                } else {
                    if !self.at_punct(Punct::Semicolon) {
                        init = Some(self.parse_expression()?);
                    }
                    self.expect_punct(Punct::Semicolon)?;
                }

                let cond = if self.at_punct(Punct::Semicolon) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect_punct(Punct::Semicolon)?;

                let step = if self.at_punct(Punct::RParen) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                self.expect_punct(Punct::RParen)?;

                let body = Box::new(self.parse_statement()?);

                Ok(Stmt::For {
                    init,
                    init_decl,
                    cond,
                    step,
                    body,
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::Switch) => {
                self.pos += 1;
                self.expect_punct(Punct::LParen)?;
                let cond = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                let body = Box::new(self.parse_statement()?);

                Ok(Stmt::Switch {
                    cond,
                    body,
                    // Filled by the jump resolver.
                    cases: vec![],
                    default_label: None,
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::Case) => {
                self.pos += 1;
                let expr = self.parse_conditional_expr()?;
                self.expect_punct(Punct::Colon)?;
                let stmt = Box::new(self.parse_statement()?);

                Ok(Stmt::Case {
                    expr,
                    stmt,
                    pos,
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::Default) => {
                self.pos += 1;
                self.expect_punct(Punct::Colon)?;
                let stmt = Box::new(self.parse_statement()?);

                Ok(Stmt::Default {
                    stmt,
                    pos,
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::Break) => {
                self.pos += 1;
                self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Break {
                    pos,
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.pos += 1;
                self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Continue {
                    pos,
                    label: String::new(),
                })
            }
            TokenKind::Keyword(Keyword::Goto) => {
                self.pos += 1;
                let (name, _) = self.expect_ident()?;
                self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Goto {
                    name,
                    pos,
                    canonical: String::new(),
                })
            }
            TokenKind::Punct(Punct::Semicolon) => {
                self.pos += 1;
                Ok(Stmt::Empty)
            }
            TokenKind::Punct(Punct::LBrace) => Ok(Stmt::Block(self.parse_block()?)),
            // Labeled statement: an identifier directly followed by ':'.
            TokenKind::Ident(name)
                if self.peek_at(1).kind == TokenKind::Punct(Punct::Colon) =>
            {
                let name = name.clone();
                self.pos += 2;
                let stmt = Box::new(self.parse_statement()?);
                Ok(Stmt::Label {
                    name,
                    stmt,
                    pos,
                    canonical: String::new(),
                })
            }
            _ => {
                let expr = self.parse_expression()?;
                self.expect_punct(Punct::Semicolon)?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    // ----- expressions --------------------------------------------------

    /// Full expression, including the comma operator.
    fn parse_expression(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_assign_expr()?;

        while self.at_punct(Punct::Comma) {
            let pos = self.pos_here();
            self.pos += 1;
            let rhs = self.parse_assign_expr()?;
            lhs = Expr::new(
                ExprKind::Comma {
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }

        Ok(lhs)
    }

    fn parse_assign_expr(&mut self) -> Result<Expr> {
        let lhs = self.parse_conditional_expr()?;

        let op = match self.peek().kind {
            TokenKind::Punct(Punct::Assign) => None,
            TokenKind::Punct(Punct::PlusAssign) => Some(BinaryOp::Add),
            TokenKind::Punct(Punct::MinusAssign) => Some(BinaryOp::Sub),
            TokenKind::Punct(Punct::StarAssign) => Some(BinaryOp::Mul),
            TokenKind::Punct(Punct::SlashAssign) => Some(BinaryOp::Div),
            TokenKind::Punct(Punct::PercentAssign) => Some(BinaryOp::Mod),
            TokenKind::Punct(Punct::AmpAssign) => Some(BinaryOp::BitAnd),
            TokenKind::Punct(Punct::PipeAssign) => Some(BinaryOp::BitOr),
            TokenKind::Punct(Punct::CaretAssign) => Some(BinaryOp::BitXor),
            TokenKind::Punct(Punct::ShlAssign) => Some(BinaryOp::Shl),
            TokenKind::Punct(Punct::ShrAssign) => Some(BinaryOp::Shr),
            _ => return Ok(lhs),
        };

        let pos = self.pos_here();
        self.pos += 1;

        // Right-associative: `a = b = c` assigns c to b first.
        let rhs = self.parse_assign_expr()?;

        let kind = match op {
            None => ExprKind::Assign {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            Some(op) => ExprKind::OpAssign {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        };

        Ok(Expr::new(kind, pos))
    }

    fn parse_conditional_expr(&mut self) -> Result<Expr> {
        let cond = self.parse_binary_expr(1)?;

        if !self.at_punct(Punct::Question) {
            return Ok(cond);
        }

        let pos = self.pos_here();
        self.pos += 1;
        let then = self.parse_expression()?;
        self.expect_punct(Punct::Colon)?;
        let otherwise = self.parse_conditional_expr()?;

        Ok(Expr::new(
            ExprKind::Cond {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
            pos,
        ))
    }

    /// Binding power of binary operators; higher binds tighter.
    fn binop_for(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
        let pair = match kind {
            TokenKind::Punct(Punct::Star) => (BinaryOp::Mul, 10),
            TokenKind::Punct(Punct::Slash) => (BinaryOp::Div, 10),
            TokenKind::Punct(Punct::Percent) => (BinaryOp::Mod, 10),
            TokenKind::Punct(Punct::Plus) => (BinaryOp::Add, 9),
            TokenKind::Punct(Punct::Minus) => (BinaryOp::Sub, 9),
            TokenKind::Punct(Punct::Shl) => (BinaryOp::Shl, 8),
            TokenKind::Punct(Punct::Shr) => (BinaryOp::Shr, 8),
            TokenKind::Punct(Punct::Lt) => (BinaryOp::Lt, 7),
            TokenKind::Punct(Punct::Le) => (BinaryOp::Le, 7),
            TokenKind::Punct(Punct::Gt) => (BinaryOp::Gt, 7),
            TokenKind::Punct(Punct::Ge) => (BinaryOp::Ge, 7),
            TokenKind::Punct(Punct::EqEq) => (BinaryOp::Eq, 6),
            TokenKind::Punct(Punct::NotEq) => (BinaryOp::NotEq, 6),
            TokenKind::Punct(Punct::Amp) => (BinaryOp::BitAnd, 5),
            TokenKind::Punct(Punct::Caret) => (BinaryOp::BitXor, 4),
            TokenKind::Punct(Punct::Pipe) => (BinaryOp::BitOr, 3),
            TokenKind::Punct(Punct::AmpAmp) => (BinaryOp::LogAnd, 2),
            TokenKind::Punct(Punct::PipePipe) => (BinaryOp::LogOr, 1),
            _ => return None,
        };
        Some(pair)
    }

    /// Precedence climbing over left-associative binary operators.
    fn parse_binary_expr(&mut self, min_prec: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary_expr()?;

        while let Some((op, prec)) = Self::binop_for(&self.peek().kind) {
            if prec < min_prec {
                break;
            }

            let pos = self.pos_here();
            self.pos += 1;
            let rhs = self.parse_binary_expr(prec + 1)?;

            lhs = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                pos,
            );
        }

        Ok(lhs)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr> {
        let pos = self.pos_here();

        match &self.peek().kind {
            TokenKind::Punct(Punct::Plus) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Plus,
                        expr: Box::new(expr),
                    },
                    pos,
                ))
            }
            TokenKind::Punct(Punct::Minus) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Minus,
                        expr: Box::new(expr),
                    },
                    pos,
                ))
            }
            TokenKind::Punct(Punct::Bang) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::Not,
                        expr: Box::new(expr),
                    },
                    pos,
                ))
            }
            TokenKind::Punct(Punct::Tilde) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(
                    ExprKind::Unary {
                        op: UnaryOp::BitNot,
                        expr: Box::new(expr),
                    },
                    pos,
                ))
            }
            TokenKind::Punct(Punct::Star) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(ExprKind::Deref(Box::new(expr)), pos))
            }
            TokenKind::Punct(Punct::Amp) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(ExprKind::AddrOf(Box::new(expr)), pos))
            }
            TokenKind::Punct(Punct::PlusPlus) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(
                    ExprKind::IncDec {
                        inc: true,
                        prefix: true,
                        expr: Box::new(expr),
                    },
                    pos,
                ))
            }
            TokenKind::Punct(Punct::MinusMinus) => {
                self.pos += 1;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(
                    ExprKind::IncDec {
                        inc: false,
                        prefix: true,
                        expr: Box::new(expr),
                    },
                    pos,
                ))
            }
            TokenKind::Keyword(Keyword::Sizeof) => {
                self.pos += 1;

                if self.at_punct(Punct::LParen) && self.type_starts_at(1) {
                    self.pos += 1;
                    let ty = self.parse_type()?;
                    self.expect_punct(Punct::RParen)?;
                    Ok(Expr::new(ExprKind::SizeofType(ty), pos))
                } else {
                    let expr = self.parse_unary_expr()?;
                    Ok(Expr::new(ExprKind::SizeofExpr(Box::new(expr)), pos))
                }
            }
            // Cast: `(type) unary`.
            TokenKind::Punct(Punct::LParen) if self.type_starts_at(1) => {
                self.pos += 1;
                let to = self.parse_type()?;
                self.expect_punct(Punct::RParen)?;
                let expr = self.parse_unary_expr()?;
                Ok(Expr::new(
                    ExprKind::Cast {
                        to,
                        expr: Box::new(expr),
                    },
                    pos,
                ))
            }
            _ => self.parse_postfix_expr(),
        }
    }

    /// Does the token `ahead` positions from here begin a type?
    fn type_starts_at(&self, ahead: usize) -> bool {
        match &self.peek_at(ahead).kind {
            TokenKind::Keyword(
                Keyword::Void
                | Keyword::Char
                | Keyword::Short
                | Keyword::Int
                | Keyword::Long
                | Keyword::Unsigned
                | Keyword::Signed
                | Keyword::Struct
                | Keyword::Union,
            ) => true,
            TokenKind::Ident(name) => self.typedefs.contains(name),
            _ => false,
        }
    }

    fn parse_postfix_expr(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary_expr()?;

        loop {
            let pos = self.pos_here();
            match self.peek().kind {
                TokenKind::Punct(Punct::LParen) => {
                    self.pos += 1;
                    let mut args = vec![];
                    if !self.at_punct(Punct::RParen) {
                        loop {
                            args.push(self.parse_assign_expr()?);
                            if !self.accept_punct(Punct::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect_punct(Punct::RParen)?;
                    expr = Expr::new(
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                        },
                        pos,
                    );
                }
                TokenKind::Punct(Punct::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_expression()?;
                    self.expect_punct(Punct::RBracket)?;
                    expr = Expr::new(
                        ExprKind::Index {
                            expr: Box::new(expr),
                            index: Box::new(index),
                        },
                        pos,
                    );
                }
                TokenKind::Punct(Punct::Dot) => {
                    self.pos += 1;
                    let (name, _) = self.expect_ident()?;
                    expr = Expr::new(
                        ExprKind::Member {
                            expr: Box::new(expr),
                            name,
                        },
                        pos,
                    );
                }
                TokenKind::Punct(Punct::Arrow) => {
                    self.pos += 1;
                    let (name, _) = self.expect_ident()?;
                    expr = Expr::new(
                        ExprKind::PtrMember {
                            expr: Box::new(expr),
                            name,
                        },
                        pos,
                    );
                }
                TokenKind::Punct(Punct::PlusPlus) => {
                    self.pos += 1;
                    expr = Expr::new(
                        ExprKind::IncDec {
                            inc: true,
                            prefix: false,
                            expr: Box::new(expr),
                        },
                        pos,
                    );
                }
                TokenKind::Punct(Punct::MinusMinus) => {
                    self.pos += 1;
                    expr = Expr::new(
                        ExprKind::IncDec {
                            inc: false,
                            prefix: false,
                            expr: Box::new(expr),
                        },
                        pos,
                    );
                }
                _ => break,
            }
        }

        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr> {
        let pos = self.pos_here();

        match self.peek().kind.clone() {
            TokenKind::Int {
                value,
                unsigned,
                long,
            } => {
                self.pos += 1;
                Ok(Expr::new(
                    ExprKind::IntLit {
                        value,
                        unsigned,
                        long,
                    },
                    pos,
                ))
            }
            TokenKind::CharLit(b) => {
                self.pos += 1;
                Ok(Expr::new(
                    ExprKind::IntLit {
                        value: b as i64,
                        unsigned: false,
                        long: false,
                    },
                    pos,
                ))
            }
            TokenKind::StrLit(bytes) => {
                self.pos += 1;
                Ok(Expr::new(ExprKind::StrLit(bytes), pos))
            }
            TokenKind::Ident(name) => {
                self.pos += 1;
                Ok(Expr::new(ExprKind::Var { name, entity: None }, pos))
            }
            TokenKind::Punct(Punct::LParen) => {
                self.pos += 1;
                let expr = self.parse_expression()?;
                self.expect_punct(Punct::RParen)?;
                Ok(expr)
            }
            found => Err(self.error_here(format!("unexpected token '{found}' in expression"))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn parse_source(src: &str) -> Result<Ast> {
        let mut diag = Diagnostics::new();
        parse_source_diag(src, &mut diag)
    }

    pub(crate) fn parse_source_diag(src: &str, diag: &mut Diagnostics) -> Result<Ast> {
        let path = Path::new("test.cb");
        let tokens = lexer::tokenize(path, src.as_bytes(), diag)?;
        let mark = diag.error_count();
        let mut parser = Parser::new(&tokens, diag);
        let mut importer = Importer::new(vec![]);
        let decls = parser.parse_unit(&mut importer);
        parser.diag.checkpoint(mark, Error::Syntax)?;
        Ok(Ast {
            decls,
            tokens,
            entities: EntityArena::new(),
        })
    }

    #[test]
    fn parses_minimal_main() {
        let ast = parse_source("int main(void) { return 0; }").expect("parse");
        assert_eq!(ast.decls.len(), 1);
        let Declaration::DefinedFunction(func) = &ast.decls[0] else {
            panic!("expected function definition");
        };
        assert_eq!(func.name, "main");
        assert!(func.params.is_empty());
    }

    #[test]
    fn precedence_orders_mul_over_add() {
        let ast = parse_source("int main(void) { return 1+2*3; }").expect("parse");
        let Declaration::DefinedFunction(func) = &ast.decls[0] else {
            panic!("expected function");
        };
        let BlockItem::Stmt(Stmt::Return { expr: Some(expr), .. }) = &func.body.items[0] else {
            panic!("expected return");
        };
        assert_eq!(expr.to_string(), "(1 + (2 * 3))");
    }

    #[test]
    fn assignment_is_right_associative() {
        let ast = parse_source("int main(void) { int a; int b; a = b = 1; return a; }")
            .expect("parse");
        let Declaration::DefinedFunction(func) = &ast.decls[0] else {
            panic!("expected function");
        };
        let BlockItem::Stmt(Stmt::Expr(expr)) = &func.body.items[2] else {
            panic!("expected expression statement");
        };
        assert_eq!(expr.to_string(), "(a = (b = 1))");
    }

    #[test]
    fn parses_struct_definition_and_member_access() {
        let src = "struct P { int x; int y; };\n\
                   int main(void) { struct P p; p.x = 3; return p.x; }";
        let ast = parse_source(src).expect("parse");
        assert!(matches!(&ast.decls[0], Declaration::StructDef(def) if def.members.len() == 2));
    }

    #[test]
    fn parses_pointer_and_array_declarators() {
        let ast = parse_source("int main(void) { int *p; int a[3]; return 0; }").expect("parse");
        let Declaration::DefinedFunction(func) = &ast.decls[0] else {
            panic!("expected function");
        };
        let BlockItem::Decl(p) = &func.body.items[0] else {
            panic!("expected declaration");
        };
        assert!(matches!(p.ty.kind, TypeRefKind::Pointer(_)));
        let BlockItem::Decl(a) = &func.body.items[1] else {
            panic!("expected declaration");
        };
        assert!(matches!(a.ty.kind, TypeRefKind::Array(_, 3)));
    }

    #[test]
    fn parses_control_flow_statements() {
        let src = "int main(void) {\n\
                   int i; for (i = 0; i < 10; i++) { if (i == 5) break; else continue; }\n\
                   while (i) i--;\n\
                   do i++; while (i < 3);\n\
                   switch (i) { case 1: return 1; default: break; }\n\
                   return 0; }";
        parse_source(src).expect("parse");
    }

    #[test]
    fn parses_goto_and_labels() {
        let src = "int main(void) { goto done; done: return 0; }";
        let ast = parse_source(src).expect("parse");
        let Declaration::DefinedFunction(func) = &ast.decls[0] else {
            panic!("expected function");
        };
        assert!(matches!(
            &func.body.items[0],
            BlockItem::Stmt(Stmt::Goto { name, .. }) if name == "done"
        ));
    }

    #[test]
    fn parses_extern_variadic_prototype() {
        let ast = parse_source("extern int printf(char *fmt, ...);").expect("parse");
        let Declaration::UndefinedFunction(func) = &ast.decls[0] else {
            panic!("expected prototype");
        };
        assert!(func.variadic);
        assert_eq!(func.params.len(), 1);
    }

    #[test]
    fn typedef_names_parse_as_types() {
        let src = "typedef int size; int main(void) { size n; n = 4; return n; }";
        parse_source(src).expect("parse");
    }

    #[test]
    fn cast_and_sizeof_forms() {
        let src = "int main(void) { long n; n = (long) 3; return sizeof(int) + sizeof n; }";
        parse_source(src).expect("parse");
    }

    #[test]
    fn reports_multiple_syntax_errors() {
        let mut diag = Diagnostics::new();
        let src = "int main(void) { return 1 +; int 2x; return 0; }";
        let result = parse_source_diag(src, &mut diag);
        assert!(result.is_err());
        assert!(diag.error_count() >= 2);
    }

    #[test]
    fn recovers_at_statement_boundary() {
        let mut diag = Diagnostics::new();
        // The error in the first statement must not hide the second one.
        let src = "int main(void) { 1 +; @ }";
        assert!(parse_source_diag(src, &mut diag).is_err());
    }

    #[test]
    fn missing_import_is_reported() {
        let mut diag = Diagnostics::new();
        let result = parse_source_diag("import no.such.unit;", &mut diag);
        assert!(result.is_err());
        assert_eq!(diag.error_count(), 1);
    }
}
