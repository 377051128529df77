//! Cypher recursive descent parser.
//!
//! Parses token streams into AST nodes. Supports:
//! - MATCH / OPTIONAL MATCH with patterns, UNWIND, WITH (pipeline stages)
//! - WHERE, RETURN, ORDER BY, SKIP, LIMIT
//! - CREATE, MERGE, DELETE / DETACH DELETE, SET, REMOVE
//! - CALL proc(...) YIELD ... and CALL { subquery } YIELD ...
//! - FOREACH (x IN list | body)
//! - UNION / UNION ALL
//! - Full expression parsing with precedence

use crate::{Error, Result};
use super::ast::*;
use super::lexer::{Token, TokenKind};
use std::collections::HashMap;

/// Parser state — wraps a token slice with cursor.
struct Parser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl<'t> Parser<'t> {
    fn new(tokens: &'t [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    /// Peek `n` tokens ahead (0 = current).
    fn peek_ahead(&self, n: usize) -> TokenKind {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        self.tokens[idx].kind
    }

    fn advance(&mut self) -> &Token {
        let tok = &self.tokens[self.pos.min(self.tokens.len() - 1)];
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&Token> {
        let tok = self.peek();
        if tok.kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error(format!("Expected {:?}, got {:?} '{}'", kind, tok.kind, tok.text)))
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, msg: String) -> Error {
        Error::SyntaxError {
            position: self.peek().span.start,
            message: msg,
        }
    }
}

/// Parse a complete Cypher statement from tokens, including UNION chains.
pub fn parse_statement(tokens: &[Token]) -> Result<Statement> {
    let mut p = Parser::new(tokens);

    let mut stmt = parse_single_statement(&mut p)?;

    while p.at(TokenKind::Union) {
        p.advance();
        let all = p.eat(TokenKind::All);
        let right = parse_single_statement(&mut p)?;
        stmt = Statement::Union(UnionClause {
            left: Box::new(stmt),
            right: Box::new(right),
            all,
        });
    }

    p.eat(TokenKind::Semicolon);
    if !p.at(TokenKind::Eof) {
        return Err(p.error(format!("Unexpected token after statement: {:?}", p.peek_kind())));
    }

    Ok(stmt)
}

fn parse_single_statement(p: &mut Parser) -> Result<Statement> {
    match p.peek_kind() {
        TokenKind::Match | TokenKind::OptionalMatch | TokenKind::Unwind | TokenKind::With | TokenKind::Call => {
            parse_query_stmt(p)
        }
        TokenKind::Create => {
            // Peek ahead: CREATE INDEX / CREATE CONSTRAINT → schema
            let saved = p.pos;
            p.advance(); // eat CREATE
            if p.at(TokenKind::Index) || p.at(TokenKind::Constraint) {
                p.pos = saved;
                parse_schema_stmt(p)
            } else {
                p.pos = saved;
                parse_create_stmt(p)
            }
        }
        TokenKind::Merge => parse_merge_stmt(p),
        TokenKind::Delete | TokenKind::DetachDelete => parse_delete_stmt(p),
        TokenKind::Drop => parse_schema_stmt(p),
        TokenKind::Foreach => {
            let f = parse_foreach_clause(p)?;
            Ok(Statement::Foreach(f))
        }
        kind => Err(p.error(format!("Unexpected token {:?} at start of statement", kind))),
    }
}

// ============================================================================
// Query pipeline parsing: MATCH / UNWIND / WITH / CALL, terminated by RETURN
// ============================================================================

fn parse_query_stmt(p: &mut Parser) -> Result<Statement> {
    let mut parts = Vec::new();

    loop {
        match p.peek_kind() {
            TokenKind::Match | TokenKind::OptionalMatch => {
                parts.push(QueryPart::Match(parse_match_clause(p)?));
            }
            TokenKind::Unwind => {
                p.advance();
                let expr = parse_expr(p)?;
                p.expect(TokenKind::As)?;
                let alias = p.expect(TokenKind::Identifier)?.text.clone();
                parts.push(QueryPart::Unwind { expr, alias });
            }
            TokenKind::With => {
                p.advance();
                parts.push(QueryPart::With(parse_with_clause(p)?));
            }
            TokenKind::Call => {
                parts.push(parse_call_part(p)?);
            }
            _ => break,
        }
    }

    // MATCH ... SET ...
    if p.at(TokenKind::Set) {
        p.advance();
        let items = parse_set_items(p)?;
        let return_clause = if p.at(TokenKind::Return) {
            p.advance();
            Some(parse_return_clause(p)?)
        } else {
            None
        };
        return Ok(Statement::Set(SetClause {
            matches: parts_to_matches(parts),
            items,
            return_clause,
        }));
    }

    // MATCH ... DELETE/DETACH DELETE ...
    if p.at(TokenKind::Delete) || p.at(TokenKind::DetachDelete) {
        let detach = p.at(TokenKind::DetachDelete);
        p.advance();
        if detach && p.at(TokenKind::Delete) {
            p.advance(); // consume DELETE after DETACH
        }
        let variables = parse_variable_list(p)?;
        return Ok(Statement::Delete(DeleteClause {
            matches: parts_to_matches(parts),
            variables,
            detach,
        }));
    }

    // MATCH ... REMOVE ...
    if p.at(TokenKind::Remove) {
        p.advance();
        let items = parse_remove_items(p)?;
        let return_clause = if p.at(TokenKind::Return) {
            p.advance();
            Some(parse_return_clause(p)?)
        } else {
            None
        };
        return Ok(Statement::Remove(RemoveClause {
            matches: parts_to_matches(parts),
            items,
            return_clause,
        }));
    }

    // Otherwise this must terminate with RETURN — unless it's a bare CALL
    // procedure with no RETURN, whose YIELD columns become the result.
    let (return_clause, order_by, skip, limit) = if p.at(TokenKind::Return) {
        p.advance();
        let return_clause = parse_return_clause(p)?;
        let order_by = if p.at(TokenKind::Order) {
            p.advance();
            p.expect(TokenKind::By)?;
            Some(parse_order_by(p)?)
        } else {
            None
        };
        let skip = if p.at(TokenKind::Skip) {
            p.advance();
            Some(parse_expr(p)?)
        } else {
            None
        };
        let limit = if p.at(TokenKind::Limit) {
            p.advance();
            Some(parse_expr(p)?)
        } else {
            None
        };
        (return_clause, order_by, skip, limit)
    } else {
        (implicit_return(&parts)?, None, None, None)
    };

    Ok(Statement::Query(Query {
        parts,
        return_clause,
        order_by,
        skip,
        limit,
    }))
}

/// Without an explicit RETURN, a pipeline ending in a bare CALL or WITH
/// exposes its last stage's bindings as the result columns.
fn implicit_return(parts: &[QueryPart]) -> Result<ReturnClause> {
    match parts.last() {
        Some(QueryPart::CallProcedure(c)) if !c.yields.is_empty() => {
            Ok(ReturnClause {
                distinct: false,
                items: c.yields.iter().map(|y| ReturnItem {
                    expr: Expr::Variable(y.alias.clone().unwrap_or_else(|| y.name.clone())),
                    alias: None,
                }).collect(),
            })
        }
        Some(QueryPart::CallSubquery(c)) if !c.yields.is_empty() => {
            Ok(ReturnClause {
                distinct: false,
                items: c.yields.iter().map(|y| ReturnItem {
                    expr: Expr::Variable(y.alias.clone().unwrap_or_else(|| y.name.clone())),
                    alias: None,
                }).collect(),
            })
        }
        Some(QueryPart::With(w)) => Ok(ReturnClause { distinct: w.distinct, items: w.items.clone() }),
        _ => Err(Error::SyntaxError {
            position: 0,
            message: "Expected RETURN clause".into(),
        }),
    }
}

/// Flattens the pipeline's MATCH parts into a plain list for write clauses
/// (DELETE/SET/REMOVE) that only consume pattern bindings, not UNWIND/WITH.
fn parts_to_matches(parts: Vec<QueryPart>) -> Vec<MatchClause> {
    parts.into_iter().filter_map(|part| match part {
        QueryPart::Match(m) => Some(m),
        _ => None,
    }).collect()
}

fn parse_match_clause(p: &mut Parser) -> Result<MatchClause> {
    let optional = if p.at(TokenKind::OptionalMatch) {
        p.advance(); // consume OPTIONAL
        if p.at(TokenKind::Match) {
            p.advance();
        }
        true
    } else {
        p.advance(); // consume MATCH
        false
    };

    let patterns = parse_pattern_list(p)?;

    let where_clause = if p.at(TokenKind::Where) {
        p.advance();
        Some(parse_expr(p)?)
    } else {
        None
    };

    Ok(MatchClause { optional, patterns, where_clause })
}

/// `CALL proc(args) [YIELD ...]` or `CALL { inner } [YIELD ...]`.
fn parse_call_part(p: &mut Parser) -> Result<QueryPart> {
    p.expect(TokenKind::Call)?;

    if p.at(TokenKind::LBrace) {
        p.advance();
        let inner_tokens_start = p.pos;
        let inner = parse_single_statement(p)?;
        let _ = inner_tokens_start;
        p.expect(TokenKind::RBrace)?;
        let yields = parse_optional_yield(p)?;
        return Ok(QueryPart::CallSubquery(CallSubqueryClause { inner: Box::new(inner), yields }));
    }

    let mut name = p.expect(TokenKind::Identifier)?.text.clone();
    while p.eat(TokenKind::Dot) {
        let part = p.expect(TokenKind::Identifier)?.text.clone();
        name = format!("{name}.{part}");
    }

    p.expect(TokenKind::LParen)?;
    let mut args = Vec::new();
    if !p.at(TokenKind::RParen) {
        args.push(parse_expr(p)?);
        while p.eat(TokenKind::Comma) {
            args.push(parse_expr(p)?);
        }
    }
    p.expect(TokenKind::RParen)?;

    let yields = parse_optional_yield(p)?;

    Ok(QueryPart::CallProcedure(CallProcedureClause { name, args, yields }))
}

fn parse_optional_yield(p: &mut Parser) -> Result<Vec<YieldItem>> {
    let mut yields = Vec::new();
    if p.eat(TokenKind::Yield) {
        yields.push(parse_yield_item(p)?);
        while p.eat(TokenKind::Comma) {
            yields.push(parse_yield_item(p)?);
        }
    }
    Ok(yields)
}

fn parse_yield_item(p: &mut Parser) -> Result<YieldItem> {
    let name = p.expect(TokenKind::Identifier)?.text.clone();
    let alias = if p.eat(TokenKind::As) {
        Some(p.expect(TokenKind::Identifier)?.text.clone())
    } else {
        None
    };
    Ok(YieldItem { name, alias })
}

// ============================================================================
// FOREACH
// ============================================================================

fn parse_foreach_clause(p: &mut Parser) -> Result<ForeachClause> {
    p.expect(TokenKind::Foreach)?;
    p.expect(TokenKind::LParen)?;
    let variable = p.expect(TokenKind::Identifier)?.text.clone();
    p.expect(TokenKind::In)?;
    let list_expr = parse_expr(p)?;
    p.expect(TokenKind::Pipe)?;

    let mut body = Vec::new();
    loop {
        match p.peek_kind() {
            TokenKind::Create => body.push(parse_create_stmt(p)?),
            TokenKind::Merge => body.push(parse_merge_stmt(p)?),
            TokenKind::Set => {
                p.advance();
                let items = parse_set_items(p)?;
                body.push(Statement::Set(SetClause { matches: Vec::new(), items, return_clause: None }));
            }
            TokenKind::Delete | TokenKind::DetachDelete => body.push(parse_delete_stmt(p)?),
            TokenKind::Remove => {
                p.advance();
                let items = parse_remove_items(p)?;
                body.push(Statement::Remove(RemoveClause { matches: Vec::new(), items, return_clause: None }));
            }
            TokenKind::Foreach => body.push(Statement::Foreach(parse_foreach_clause(p)?)),
            _ => break,
        }
    }
    p.expect(TokenKind::RParen)?;

    Ok(ForeachClause { variable, list_expr, body })
}

// ============================================================================
// Statement parsers
// ============================================================================

fn parse_create_stmt(p: &mut Parser) -> Result<Statement> {
    p.expect(TokenKind::Create)?;
    let patterns = parse_pattern_list(p)?;

    let return_clause = if p.at(TokenKind::Return) {
        p.advance();
        Some(parse_return_clause(p)?)
    } else {
        None
    };

    Ok(Statement::Create(CreateClause { patterns, return_clause }))
}

fn parse_merge_stmt(p: &mut Parser) -> Result<Statement> {
    p.expect(TokenKind::Merge)?;
    let patterns = parse_pattern_list(p)?;

    let pattern = patterns.into_iter().next()
        .ok_or_else(|| p.error("MERGE requires a pattern".into()))?;

    let mut on_create = Vec::new();
    let mut on_match = Vec::new();

    while p.at(TokenKind::On) {
        p.advance(); // consume ON
        if p.at(TokenKind::Create) {
            p.advance();
            p.expect(TokenKind::Set)?;
            on_create.extend(parse_set_items(p)?);
        } else if p.at(TokenKind::Match) {
            p.advance();
            p.expect(TokenKind::Set)?;
            on_match.extend(parse_set_items(p)?);
        } else {
            return Err(p.error(format!("Expected CREATE or MATCH after ON, got '{}'", p.peek().text)));
        }
    }

    let return_clause = if p.at(TokenKind::Return) {
        p.advance();
        Some(parse_return_clause(p)?)
    } else {
        None
    };

    Ok(Statement::Merge(MergeClause {
        pattern,
        on_create,
        on_match,
        return_clause,
    }))
}

fn parse_schema_stmt(p: &mut Parser) -> Result<Statement> {
    if p.at(TokenKind::Create) {
        p.advance(); // CREATE
        if p.at(TokenKind::Index) {
            p.advance(); // INDEX
            parse_create_index(p)
        } else if p.at(TokenKind::Constraint) {
            p.advance(); // CONSTRAINT
            parse_create_constraint(p)
        } else {
            Err(p.error("Expected INDEX or CONSTRAINT after CREATE".into()))
        }
    } else if p.at(TokenKind::Drop) {
        p.advance(); // DROP
        if p.at(TokenKind::Index) {
            p.advance(); // INDEX
            parse_drop_index(p)
        } else if p.at(TokenKind::Constraint) {
            p.advance(); // CONSTRAINT
            parse_drop_constraint(p)
        } else {
            Err(p.error("Expected INDEX or CONSTRAINT after DROP".into()))
        }
    } else {
        Err(p.error("Expected CREATE or DROP for schema command".into()))
    }
}

fn parse_create_index(p: &mut Parser) -> Result<Statement> {
    // CREATE INDEX [name] FOR (n:Label) ON (n.property)
    // or simplified: CREATE INDEX ON :Label(property)
    let _name = if p.at(TokenKind::Identifier) && !p.at(TokenKind::On) && !p.at(TokenKind::For) {
        let tok = p.advance();
        Some(tok.text.clone())
    } else {
        None
    };

    let index_type = None;

    if p.at(TokenKind::On) {
        p.advance(); // ON
        p.expect(TokenKind::Colon)?;
        let label_tok = p.advance();
        let label = label_tok.text.clone();
        p.expect(TokenKind::LParen)?;
        let prop_tok = p.advance();
        let property = prop_tok.text.clone();
        p.expect(TokenKind::RParen)?;

        return Ok(Statement::Schema(SchemaCommand::CreateIndex { label, property, index_type }));
    }

    if p.at(TokenKind::For) {
        p.advance(); // FOR
        p.expect(TokenKind::LParen)?;
        let _alias = p.advance();
        p.expect(TokenKind::Colon)?;
        let label_tok = p.advance();
        let label = label_tok.text.clone();
        p.expect(TokenKind::RParen)?;

        p.expect(TokenKind::On)?;
        p.expect(TokenKind::LParen)?;
        let _alias2 = p.advance();
        p.expect(TokenKind::Dot)?;
        let prop_tok = p.advance();
        let property = prop_tok.text.clone();
        p.expect(TokenKind::RParen)?;

        if p.at(TokenKind::Identifier) && p.peek().text.eq_ignore_ascii_case("OPTIONS") {
            p.advance();
            if p.at(TokenKind::LBrace) {
                let _ = skip_braced(p);
            }
        }

        return Ok(Statement::Schema(SchemaCommand::CreateIndex { label, property, index_type }));
    }

    Err(p.error("Expected ON or FOR after CREATE INDEX".into()))
}

fn parse_create_constraint(p: &mut Parser) -> Result<Statement> {
    // CREATE CONSTRAINT [name] FOR (n:Label) REQUIRE n.property IS UNIQUE
    // or CREATE CONSTRAINT ON (n:Label) ASSERT n.property IS UNIQUE
    let _name = if p.at(TokenKind::Identifier) && !p.at(TokenKind::On) && !p.at(TokenKind::For) {
        let tok = p.advance();
        Some(tok.text.clone())
    } else {
        None
    };

    if p.at(TokenKind::For) || p.at(TokenKind::On) {
        p.advance();
    } else {
        return Err(p.error("Expected FOR or ON after CONSTRAINT [name]".into()));
    }

    p.expect(TokenKind::LParen)?;
    let _alias = p.advance();
    p.expect(TokenKind::Colon)?;
    let label_tok = p.advance();
    let label = label_tok.text.clone();
    p.expect(TokenKind::RParen)?;

    let _req_tok = p.advance(); // REQUIRE / ASSERT
    let _alias2 = p.advance();
    p.expect(TokenKind::Dot)?;
    let prop_tok = p.advance();
    let property = prop_tok.text.clone();

    let constraint_type = if p.at(TokenKind::Is) {
        p.advance();
        let type_tok = p.advance();
        type_tok.text.to_uppercase()
    } else {
        "UNIQUE".to_string()
    };

    Ok(Statement::Schema(SchemaCommand::CreateConstraint { label, property, constraint_type }))
}

fn parse_drop_index(p: &mut Parser) -> Result<Statement> {
    if p.at(TokenKind::On) {
        p.advance();
        p.expect(TokenKind::Colon)?;
        let label_tok = p.advance();
        let label = label_tok.text.clone();
        p.expect(TokenKind::LParen)?;
        let prop_tok = p.advance();
        let property = prop_tok.text.clone();
        p.expect(TokenKind::RParen)?;
        Ok(Statement::Schema(SchemaCommand::DropIndex { label, property }))
    } else {
        let name_tok = p.advance();
        Ok(Statement::Schema(SchemaCommand::DropIndex {
            label: name_tok.text.clone(),
            property: String::new(),
        }))
    }
}

fn parse_drop_constraint(p: &mut Parser) -> Result<Statement> {
    if p.at(TokenKind::On) {
        p.advance();
        p.expect(TokenKind::LParen)?;
        let _alias = p.advance();
        p.expect(TokenKind::Colon)?;
        let label_tok = p.advance();
        let label = label_tok.text.clone();
        p.expect(TokenKind::RParen)?;
        while !p.at(TokenKind::Eof) && !p.at(TokenKind::Semicolon) && !p.at(TokenKind::Union) {
            p.advance();
        }
        Ok(Statement::Schema(SchemaCommand::DropConstraint { label, property: String::new() }))
    } else {
        let name_tok = p.advance();
        Ok(Statement::Schema(SchemaCommand::DropConstraint {
            label: name_tok.text.clone(),
            property: String::new(),
        }))
    }
}

/// Skip a brace-delimited block `{ ... }`.
fn skip_braced(p: &mut Parser) -> Result<()> {
    p.expect(TokenKind::LBrace)?;
    let mut depth = 1u32;
    while depth > 0 && !p.at(TokenKind::Eof) {
        if p.at(TokenKind::LBrace) { depth += 1; }
        if p.at(TokenKind::RBrace) { depth -= 1; }
        if depth > 0 { p.advance(); }
    }
    p.expect(TokenKind::RBrace)?;
    Ok(())
}

fn parse_delete_stmt(p: &mut Parser) -> Result<Statement> {
    let detach = p.at(TokenKind::DetachDelete);
    p.advance();
    if detach && p.at(TokenKind::Delete) {
        p.advance();
    }
    let variables = parse_variable_list(p)?;

    Ok(Statement::Delete(DeleteClause {
        matches: Vec::new(),
        variables,
        detach,
    }))
}

// ============================================================================
// WITH clause parsing
// ============================================================================

fn parse_with_clause(p: &mut Parser) -> Result<WithClause> {
    let distinct = p.eat(TokenKind::Distinct);
    let mut items = Vec::new();
    if p.at(TokenKind::Star) {
        p.advance();
        items.push(ReturnItem { expr: Expr::Star, alias: None });
    } else {
        items.push(parse_return_item(p)?);
        while p.eat(TokenKind::Comma) {
            items.push(parse_return_item(p)?);
        }
    }

    let where_clause = if p.at(TokenKind::Where) {
        p.advance();
        Some(parse_expr(p)?)
    } else {
        None
    };

    let order_by = if p.at(TokenKind::Order) {
        p.advance();
        p.expect(TokenKind::By)?;
        Some(parse_order_by(p)?)
    } else {
        None
    };

    let skip = if p.at(TokenKind::Skip) {
        p.advance();
        Some(parse_expr(p)?)
    } else {
        None
    };

    let limit = if p.at(TokenKind::Limit) {
        p.advance();
        Some(parse_expr(p)?)
    } else {
        None
    };

    Ok(WithClause { distinct, items, where_clause, order_by, skip, limit })
}

// ============================================================================
// REMOVE items
// ============================================================================

fn parse_remove_items(p: &mut Parser) -> Result<Vec<RemoveItem>> {
    let mut items = Vec::new();
    items.push(parse_remove_item(p)?);
    while p.eat(TokenKind::Comma) {
        items.push(parse_remove_item(p)?);
    }
    Ok(items)
}

fn parse_remove_item(p: &mut Parser) -> Result<RemoveItem> {
    let name = p.expect(TokenKind::Identifier)?.text.clone();

    if p.eat(TokenKind::Dot) {
        let key = p.expect(TokenKind::Identifier)?.text.clone();
        Ok(RemoveItem::Property { variable: name, key })
    } else if p.at(TokenKind::Colon) {
        p.advance();
        let label = p.expect(TokenKind::Identifier)?.text.clone();
        Ok(RemoveItem::Label { variable: name, label })
    } else {
        Err(p.error("Expected '.' or ':' after REMOVE variable".into()))
    }
}

// ============================================================================
// Pattern parsing
// ============================================================================

fn parse_pattern_list(p: &mut Parser) -> Result<Vec<Pattern>> {
    let mut patterns = Vec::new();
    patterns.push(parse_pattern(p)?);
    while p.eat(TokenKind::Comma) {
        patterns.push(parse_pattern(p)?);
    }
    Ok(patterns)
}

fn parse_pattern(p: &mut Parser) -> Result<Pattern> {
    // Optional named-path binding: `p = (a)-[:R]->(b)`
    let path_alias = if p.at(TokenKind::Identifier) && p.peek_ahead(1) == TokenKind::Eq {
        let name = p.advance().text.clone();
        p.advance(); // '='
        Some(name)
    } else {
        None
    };

    let mut elements = Vec::new();
    elements.push(PatternElement::Node(parse_node_pattern(p)?));

    while p.at(TokenKind::Dash) || p.at(TokenKind::LeftArrow) {
        let (rel, _dir_hint) = parse_rel_pattern(p)?;
        elements.push(PatternElement::Relationship(rel));
        elements.push(PatternElement::Node(parse_node_pattern(p)?));
    }

    Ok(Pattern { elements, path_alias })
}

fn parse_node_pattern(p: &mut Parser) -> Result<NodePattern> {
    p.expect(TokenKind::LParen)?;

    let mut alias = None;
    let mut labels = Vec::new();
    let mut properties = HashMap::new();

    if p.at(TokenKind::Identifier) {
        alias = Some(p.advance().text.clone());
    }

    while p.at(TokenKind::Colon) {
        p.advance();
        let label = p.expect(TokenKind::Identifier)?.text.clone();
        labels.push(label);
    }

    if p.at(TokenKind::LBrace) {
        properties = parse_map_literal_inner(p)?;
    }

    p.expect(TokenKind::RParen)?;

    Ok(NodePattern { alias, labels, properties })
}

fn parse_rel_pattern(p: &mut Parser) -> Result<(RelPattern, PatternDirection)> {
    let direction;

    let left_arrow = p.eat(TokenKind::LeftArrow);
    if !left_arrow {
        p.expect(TokenKind::Dash)?;
    }

    let mut alias = None;
    let mut rel_types = Vec::new();
    let mut properties = HashMap::new();
    let mut var_length = None;

    if p.at(TokenKind::LBracket) {
        p.advance();

        if p.at(TokenKind::Identifier) {
            alias = Some(p.advance().text.clone());
        }

        if p.at(TokenKind::Colon) {
            p.advance();
            rel_types.push(p.expect(TokenKind::Identifier)?.text.clone());
            while p.eat(TokenKind::Pipe) {
                rel_types.push(p.expect(TokenKind::Identifier)?.text.clone());
            }
        }

        if p.eat(TokenKind::Star) {
            let min = if p.at(TokenKind::Integer) {
                Some(p.advance().text.parse::<usize>().unwrap_or(1))
            } else {
                None
            };
            if p.eat(TokenKind::DotDot) {
                let max = if p.at(TokenKind::Integer) {
                    Some(p.advance().text.parse::<usize>().unwrap_or(100))
                } else {
                    None
                };
                var_length = Some(VarLength { min, max });
            } else if let Some(n) = min {
                var_length = Some(VarLength { min: Some(n), max: Some(n) });
            } else {
                var_length = Some(VarLength { min: None, max: None });
            }
        }

        if p.at(TokenKind::LBrace) {
            properties = parse_map_literal_inner(p)?;
        }

        p.expect(TokenKind::RBracket)?;
    }

    if left_arrow {
        p.eat(TokenKind::Dash);
        direction = PatternDirection::Left;
    } else if p.eat(TokenKind::Arrow) {
        direction = PatternDirection::Right;
    } else if p.eat(TokenKind::Dash) {
        direction = PatternDirection::Both;
    } else {
        direction = PatternDirection::Right; // default
    }

    Ok((RelPattern { alias, rel_types, direction, properties, var_length }, direction))
}

// ============================================================================
// RETURN / ORDER BY / SET helpers
// ============================================================================

fn parse_return_clause(p: &mut Parser) -> Result<ReturnClause> {
    let distinct = p.eat(TokenKind::Distinct);
    let mut items = Vec::new();

    if p.at(TokenKind::Star) {
        p.advance();
        items.push(ReturnItem { expr: Expr::Star, alias: None });
    } else {
        items.push(parse_return_item(p)?);
        while p.eat(TokenKind::Comma) {
            items.push(parse_return_item(p)?);
        }
    }

    Ok(ReturnClause { distinct, items })
}

fn parse_return_item(p: &mut Parser) -> Result<ReturnItem> {
    let expr = parse_expr(p)?;
    let alias = if p.eat(TokenKind::As) {
        Some(p.expect(TokenKind::Identifier)?.text.clone())
    } else {
        None
    };
    Ok(ReturnItem { expr, alias })
}

fn parse_order_by(p: &mut Parser) -> Result<Vec<OrderExpr>> {
    let mut exprs = Vec::new();
    exprs.push(parse_order_expr(p)?);
    while p.eat(TokenKind::Comma) {
        exprs.push(parse_order_expr(p)?);
    }
    Ok(exprs)
}

fn parse_order_expr(p: &mut Parser) -> Result<OrderExpr> {
    let expr = parse_expr(p)?;
    let ascending = if p.eat(TokenKind::Desc) {
        false
    } else {
        p.eat(TokenKind::Asc);
        true
    };
    Ok(OrderExpr { expr, ascending })
}

fn parse_set_items(p: &mut Parser) -> Result<Vec<SetItem>> {
    let mut items = Vec::new();
    items.push(parse_set_item(p)?);
    while p.eat(TokenKind::Comma) {
        items.push(parse_set_item(p)?);
    }
    Ok(items)
}

fn parse_set_item(p: &mut Parser) -> Result<SetItem> {
    let name = p.expect(TokenKind::Identifier)?.text.clone();

    if p.eat(TokenKind::Dot) {
        let key = p.expect(TokenKind::Identifier)?.text.clone();
        p.expect(TokenKind::Eq)?;
        let value = parse_expr(p)?;
        Ok(SetItem::Property { variable: name, key, value })
    } else if p.eat(TokenKind::PlusEq) {
        let value = parse_expr(p)?;
        Ok(SetItem::MergeProperties { variable: name, value })
    } else if p.eat(TokenKind::Eq) {
        let value = parse_expr(p)?;
        Ok(SetItem::AllProperties { variable: name, value })
    } else if p.at(TokenKind::Colon) {
        p.advance();
        let label = p.expect(TokenKind::Identifier)?.text.clone();
        Ok(SetItem::Label { variable: name, label })
    } else {
        Err(p.error("Expected '.', '=', '+=', or ':' after SET variable".to_string()))
    }
}

fn parse_variable_list(p: &mut Parser) -> Result<Vec<String>> {
    let mut vars = Vec::new();
    vars.push(p.expect(TokenKind::Identifier)?.text.clone());
    while p.eat(TokenKind::Comma) {
        vars.push(p.expect(TokenKind::Identifier)?.text.clone());
    }
    Ok(vars)
}

// ============================================================================
// Expression parsing (precedence climbing)
// ============================================================================

fn parse_expr(p: &mut Parser) -> Result<Expr> {
    parse_or_expr(p)
}

fn parse_or_expr(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_xor_expr(p)?;
    while p.at(TokenKind::Or) {
        p.advance();
        let right = parse_xor_expr(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op: BinaryOp::Or, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_xor_expr(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_and_expr(p)?;
    while p.at(TokenKind::Xor) {
        p.advance();
        let right = parse_and_expr(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op: BinaryOp::Xor, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_and_expr(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_not_expr(p)?;
    while p.at(TokenKind::And) {
        p.advance();
        let right = parse_not_expr(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op: BinaryOp::And, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_not_expr(p: &mut Parser) -> Result<Expr> {
    if p.eat(TokenKind::Not) {
        let expr = parse_not_expr(p)?;
        Ok(Expr::UnaryOp { op: UnaryOp::Not, expr: Box::new(expr) })
    } else {
        parse_comparison(p)
    }
}

fn parse_comparison(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_string_op(p)?;

    if p.at(TokenKind::Is) {
        p.advance();
        let negated = p.eat(TokenKind::Not);
        p.expect(TokenKind::Null)?;
        return Ok(Expr::IsNull { expr: Box::new(left), negated });
    }

    if p.at(TokenKind::In) {
        p.advance();
        let list = parse_addition(p)?;
        return Ok(Expr::In { expr: Box::new(left), list: Box::new(list) });
    }

    let op = match p.peek_kind() {
        TokenKind::Eq => Some(BinaryOp::Eq),
        TokenKind::Neq => Some(BinaryOp::Neq),
        TokenKind::Lt => Some(BinaryOp::Lt),
        TokenKind::Lte => Some(BinaryOp::Lte),
        TokenKind::Gt => Some(BinaryOp::Gt),
        TokenKind::Gte => Some(BinaryOp::Gte),
        TokenKind::RegexMatch => Some(BinaryOp::RegexMatch),
        _ => None,
    };

    if let Some(op) = op {
        p.advance();
        let right = parse_string_op(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op, right: Box::new(right) };
    }

    Ok(left)
}

fn parse_string_op(p: &mut Parser) -> Result<Expr> {
    let left = parse_addition(p)?;

    if p.at(TokenKind::StartsWith) {
        p.advance();
        let right = parse_addition(p)?;
        return Ok(Expr::StringOp { left: Box::new(left), op: StringOp::StartsWith, right: Box::new(right) });
    }
    if p.at(TokenKind::EndsWith) {
        p.advance();
        let right = parse_addition(p)?;
        return Ok(Expr::StringOp { left: Box::new(left), op: StringOp::EndsWith, right: Box::new(right) });
    }
    if p.at(TokenKind::Contains) {
        p.advance();
        let right = parse_addition(p)?;
        return Ok(Expr::StringOp { left: Box::new(left), op: StringOp::Contains, right: Box::new(right) });
    }

    Ok(left)
}

fn parse_addition(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_multiplication(p)?;
    loop {
        let op = match p.peek_kind() {
            TokenKind::Plus => BinaryOp::Add,
            TokenKind::Minus => BinaryOp::Sub,
            _ => break,
        };
        p.advance();
        let right = parse_multiplication(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_multiplication(p: &mut Parser) -> Result<Expr> {
    let mut left = parse_power(p)?;
    loop {
        let op = match p.peek_kind() {
            TokenKind::Star => BinaryOp::Mul,
            TokenKind::Slash => BinaryOp::Div,
            TokenKind::Percent => BinaryOp::Mod,
            _ => break,
        };
        p.advance();
        let right = parse_power(p)?;
        left = Expr::BinaryOp { left: Box::new(left), op, right: Box::new(right) };
    }
    Ok(left)
}

fn parse_power(p: &mut Parser) -> Result<Expr> {
    let left = parse_unary(p)?;
    if p.eat(TokenKind::Caret) {
        let right = parse_power(p)?; // right-associative
        Ok(Expr::BinaryOp { left: Box::new(left), op: BinaryOp::Pow, right: Box::new(right) })
    } else {
        Ok(left)
    }
}

fn parse_unary(p: &mut Parser) -> Result<Expr> {
    if p.eat(TokenKind::Minus) {
        let expr = parse_index_access(p)?;
        Ok(Expr::UnaryOp { op: UnaryOp::Negate, expr: Box::new(expr) })
    } else {
        parse_index_access(p)
    }
}

fn parse_index_access(p: &mut Parser) -> Result<Expr> {
    let mut expr = parse_property_access(p)?;
    while p.at(TokenKind::LBracket) {
        p.advance();
        let index = parse_expr(p)?;
        p.expect(TokenKind::RBracket)?;
        expr = Expr::Index { expr: Box::new(expr), index: Box::new(index) };
    }
    Ok(expr)
}

fn parse_property_access(p: &mut Parser) -> Result<Expr> {
    let mut expr = parse_primary(p)?;

    while p.at(TokenKind::Dot) {
        p.advance();
        let key = p.expect(TokenKind::Identifier)?.text.clone();
        expr = Expr::Property { expr: Box::new(expr), key };
    }

    if p.at(TokenKind::Colon) {
        if let Expr::Variable(_) = &expr {
            p.advance();
            let label = p.expect(TokenKind::Identifier)?.text.clone();
            expr = Expr::HasLabel { expr: Box::new(expr), label };
        }
    }

    Ok(expr)
}

fn parse_primary(p: &mut Parser) -> Result<Expr> {
    match p.peek_kind() {
        TokenKind::Integer => {
            let tok = p.advance();
            let val = tok.text.parse::<i64>().map_err(|_| {
                Error::SyntaxError { position: tok.span.start, message: "Invalid integer".into() }
            })?;
            Ok(Expr::Literal(Literal::Int(val)))
        }
        TokenKind::Float => {
            let tok = p.advance();
            let val = tok.text.parse::<f64>().map_err(|_| {
                Error::SyntaxError { position: tok.span.start, message: "Invalid float".into() }
            })?;
            Ok(Expr::Literal(Literal::Float(val)))
        }
        TokenKind::StringLiteral => {
            let tok = p.advance();
            Ok(Expr::Literal(Literal::String(tok.text.clone())))
        }
        TokenKind::True => {
            p.advance();
            Ok(Expr::Literal(Literal::Bool(true)))
        }
        TokenKind::False => {
            p.advance();
            Ok(Expr::Literal(Literal::Bool(false)))
        }
        TokenKind::Null => {
            p.advance();
            Ok(Expr::Literal(Literal::Null))
        }

        TokenKind::Parameter => {
            let tok = p.advance();
            Ok(Expr::Parameter(tok.text.clone()))
        }

        TokenKind::Star => {
            p.advance();
            Ok(Expr::Star)
        }

        TokenKind::LParen => {
            p.advance();
            let expr = parse_expr(p)?;
            p.expect(TokenKind::RParen)?;
            Ok(expr)
        }

        TokenKind::LBracket => {
            p.advance();
            let mut items = Vec::new();
            if !p.at(TokenKind::RBracket) {
                items.push(parse_expr(p)?);
                while p.eat(TokenKind::Comma) {
                    items.push(parse_expr(p)?);
                }
            }
            p.expect(TokenKind::RBracket)?;
            Ok(Expr::List(items))
        }

        TokenKind::LBrace => {
            let map = parse_map_literal_inner(p)?;
            Ok(Expr::MapLiteral(map))
        }

        TokenKind::Case => {
            p.advance();
            let operand = if !p.at(TokenKind::When) {
                Some(Box::new(parse_expr(p)?))
            } else {
                None
            };
            let mut whens = Vec::new();
            while p.eat(TokenKind::When) {
                let when_expr = parse_expr(p)?;
                p.expect(TokenKind::Then)?;
                let then_expr = parse_expr(p)?;
                whens.push((when_expr, then_expr));
            }
            let else_expr = if p.eat(TokenKind::Else) {
                Some(Box::new(parse_expr(p)?))
            } else {
                None
            };
            p.expect(TokenKind::End)?;
            Ok(Expr::Case { operand, whens, else_expr })
        }

        TokenKind::Exists => {
            p.advance();
            p.expect(TokenKind::LParen)?;
            if p.at(TokenKind::LBrace) {
                // EXISTS { MATCH ... WHERE ... } — rare form, treat brace
                // content as an inline MATCH body.
                p.advance();
                let patterns = parse_pattern_list(p)?;
                let where_clause = if p.at(TokenKind::Where) {
                    p.advance();
                    Some(parse_expr(p)?)
                } else {
                    None
                };
                p.expect(TokenKind::RBrace)?;
                p.expect(TokenKind::RParen)?;
                return Ok(Expr::Exists(Box::new(MatchClause { optional: false, patterns, where_clause })));
            }
            let patterns = parse_pattern_list(p)?;
            let where_clause = if p.at(TokenKind::Where) {
                p.advance();
                Some(parse_expr(p)?)
            } else {
                None
            };
            p.expect(TokenKind::RParen)?;
            Ok(Expr::Exists(Box::new(MatchClause { optional: false, patterns, where_clause })))
        }

        TokenKind::Identifier => {
            let tok = p.advance().clone();
            if p.at(TokenKind::LParen) {
                p.advance(); // consume (
                let mut args = Vec::new();
                let mut distinct = false;

                if p.eat(TokenKind::Distinct) {
                    distinct = true;
                }

                if p.at(TokenKind::Star) {
                    p.advance();
                } else if !p.at(TokenKind::RParen) {
                    args.push(parse_expr(p)?);
                    while p.eat(TokenKind::Comma) {
                        args.push(parse_expr(p)?);
                    }
                }
                p.expect(TokenKind::RParen)?;
                Ok(Expr::FunctionCall { name: tok.text, args, distinct })
            } else {
                Ok(Expr::Variable(tok.text))
            }
        }

        _ => Err(p.error(format!("Unexpected token in expression: {:?} '{}'", p.peek_kind(), p.peek().text))),
    }
}

fn parse_map_literal_inner(p: &mut Parser) -> Result<HashMap<String, Expr>> {
    p.expect(TokenKind::LBrace)?;
    let mut map = HashMap::new();
    if !p.at(TokenKind::RBrace) {
        let key = p.expect(TokenKind::Identifier)?.text.clone();
        p.expect(TokenKind::Colon)?;
        let value = parse_expr(p)?;
        map.insert(key, value);
        while p.eat(TokenKind::Comma) {
            let key = p.expect(TokenKind::Identifier)?.text.clone();
            p.expect(TokenKind::Colon)?;
            let value = parse_expr(p)?;
            map.insert(key, value);
        }
    }
    p.expect(TokenKind::RBrace)?;
    Ok(map)
}

// ============================================================================
// Tests
// ============================================================================
