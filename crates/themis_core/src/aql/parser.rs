//! Recursive-descent AQL parser.

use super::ast::{
    AggregateFn, BinaryOp, Collect, Cte, Direction, Expr, ForNode, ForSource, LetBinding,
    Limit, Literal, Quantifier, Query, SortSpec, UnaryOp,
};
use super::lexer::{tokenize, Keyword, Token, TokenKind};
use crate::error::{CoreError, CoreResult};

/// Parses AQL text into a [`Query`].
///
/// # Errors
///
/// Returns [`CoreError::Parse`] with the byte position of the offending
/// token.
pub fn parse(text: &str) -> CoreResult<Query> {
    let tokens = tokenize(text)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        scope: Vec::new(),
    };
    let query = parser.parse_query()?;
    parser.expect_eof()?;
    Ok(query)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Names bound by WITH / FOR / LET, used to distinguish variable
    /// sources from collections in `FOR x IN name`.
    scope: Vec<String>,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos.min(self.tokens.len() - 1)].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(&self, msg: impl Into<String>) -> CoreError {
        CoreError::parse(self.peek().pos, msg)
    }

    fn eat_keyword(&mut self, keyword: Keyword) -> bool {
        if self.peek_kind() == &TokenKind::Keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> CoreResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {keyword:?}")))
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek_kind() == kind {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> CoreResult<()> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn expect_ident(&mut self) -> CoreResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn expect_eof(&self) -> CoreResult<()> {
        if self.peek_kind() == &TokenKind::Eof {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    // ------------------------------------------------------------------
    // Query structure
    // ------------------------------------------------------------------

    fn parse_query(&mut self) -> CoreResult<Query> {
        let scope_depth = self.scope.len();
        let mut query = Query::default();

        if self.eat_keyword(Keyword::With) {
            loop {
                let name = self.expect_ident()?;
                self.expect_keyword(Keyword::As)?;
                self.expect(&TokenKind::LParen, "'('")?;
                let cte_query = self.parse_query()?;
                self.expect(&TokenKind::RParen, "')'")?;
                self.scope.push(name.clone());
                query.with.push(Cte {
                    name,
                    query: cte_query,
                });
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        loop {
            match self.peek_kind() {
                TokenKind::Keyword(Keyword::For) => {
                    self.advance();
                    let node = self.parse_for()?;
                    self.scope.push(node.var.clone());
                    query.for_nodes.push(node);
                }
                TokenKind::Keyword(Keyword::Let) => {
                    self.advance();
                    let name = self.expect_ident()?;
                    self.expect(&TokenKind::Assign, "'='")?;
                    let expr = self.parse_expr()?;
                    self.scope.push(name.clone());
                    query.lets.push(LetBinding { name, expr });
                }
                TokenKind::Keyword(Keyword::Filter) => {
                    self.advance();
                    query.filters.push(self.parse_expr()?);
                }
                TokenKind::Keyword(Keyword::Collect) => {
                    self.advance();
                    if query.collect.is_some() {
                        return Err(self.error("duplicate COLLECT clause"));
                    }
                    let collect = self.parse_collect()?;
                    for (name, _) in &collect.groups {
                        self.scope.push(name.clone());
                    }
                    for (name, _, _) in &collect.aggregates {
                        self.scope.push(name.clone());
                    }
                    query.collect = Some(collect);
                }
                TokenKind::Keyword(Keyword::Sort) => {
                    self.advance();
                    if !query.sort.is_empty() {
                        return Err(self.error("duplicate SORT clause"));
                    }
                    loop {
                        let expr = self.parse_expr()?;
                        let descending = if self.eat_keyword(Keyword::Desc) {
                            true
                        } else {
                            self.eat_keyword(Keyword::Asc);
                            false
                        };
                        query.sort.push(SortSpec { expr, descending });
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                TokenKind::Keyword(Keyword::Limit) => {
                    self.advance();
                    if query.limit.is_some() {
                        return Err(self.error("duplicate LIMIT clause"));
                    }
                    let first = self.expect_u64()?;
                    let limit = if self.eat(&TokenKind::Comma) {
                        Limit {
                            offset: first,
                            count: self.expect_u64()?,
                        }
                    } else {
                        Limit {
                            offset: 0,
                            count: first,
                        }
                    };
                    query.limit = Some(limit);
                }
                TokenKind::Keyword(Keyword::Return) => {
                    self.advance();
                    query.return_expr = Some(self.parse_expr()?);
                    break;
                }
                _ => return Err(self.error("expected FOR, LET, FILTER, COLLECT, SORT, LIMIT, or RETURN")),
            }
        }

        self.scope.truncate(scope_depth);
        Ok(query)
    }

    fn expect_u64(&mut self) -> CoreResult<u64> {
        match self.peek_kind().clone() {
            TokenKind::Int(n) if n >= 0 => {
                self.advance();
                #[allow(clippy::cast_sign_loss)]
                Ok(n as u64)
            }
            _ => Err(self.error("expected non-negative integer")),
        }
    }

    fn parse_for(&mut self) -> CoreResult<ForNode> {
        let var = self.expect_ident()?;
        self.expect_keyword(Keyword::In)?;

        // Depth prefix: `FOR v IN 1..3 OUTBOUND ...`
        if let TokenKind::Int(min) = self.peek_kind() {
            let min = *min;
            if self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::DotDot) {
                self.advance();
                self.advance();
                let max = self.expect_u64()?;
                let direction = self.expect_direction()?;
                let start = self.parse_expr()?;
                let edges = self.expect_ident()?;
                if min < 0 {
                    return Err(self.error("traversal depth must be non-negative"));
                }
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let min = min as u32;
                let max = u32::try_from(max)
                    .map_err(|_| self.error("traversal depth out of range"))?;
                return Ok(ForNode {
                    var,
                    source: ForSource::Traversal {
                        direction,
                        start: Box::new(start),
                        edges,
                        min_depth: min,
                        max_depth: max,
                    },
                });
            }
        }

        // `FOR v IN OUTBOUND [SHORTEST_PATH a TO b] edges`
        if matches!(
            self.peek_kind(),
            TokenKind::Keyword(Keyword::Outbound) | TokenKind::Keyword(Keyword::Inbound)
        ) {
            let direction = self.expect_direction()?;
            if self.eat_keyword(Keyword::ShortestPath) {
                let start = self.parse_expr()?;
                self.expect_keyword(Keyword::To)?;
                let target = self.parse_expr()?;
                let edges = self.expect_ident()?;
                return Ok(ForNode {
                    var,
                    source: ForSource::ShortestPath {
                        direction,
                        start: Box::new(start),
                        target: Box::new(target),
                        edges,
                    },
                });
            }
            let start = self.parse_expr()?;
            let edges = self.expect_ident()?;
            return Ok(ForNode {
                var,
                source: ForSource::Traversal {
                    direction,
                    start: Box::new(start),
                    edges,
                    min_depth: 1,
                    max_depth: 1,
                },
            });
        }

        // Subquery source: `FOR v IN (FOR ... RETURN ...)`
        if self.peek_kind() == &TokenKind::LParen {
            self.advance();
            let subquery = self.parse_query()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(ForNode {
                var,
                source: ForSource::Subquery(Box::new(subquery)),
            });
        }

        let name = self.expect_ident()?;
        let source = if self.scope.contains(&name) {
            ForSource::Variable(name)
        } else {
            ForSource::Collection(name)
        };
        Ok(ForNode { var, source })
    }

    fn expect_direction(&mut self) -> CoreResult<Direction> {
        if self.eat_keyword(Keyword::Outbound) {
            Ok(Direction::Outbound)
        } else if self.eat_keyword(Keyword::Inbound) {
            Ok(Direction::Inbound)
        } else {
            Err(self.error("expected OUTBOUND or INBOUND"))
        }
    }

    fn parse_collect(&mut self) -> CoreResult<Collect> {
        let mut collect = Collect {
            groups: Vec::new(),
            aggregates: Vec::new(),
        };

        // Group keys are optional: `COLLECT AGGREGATE n = COUNT(1)` is valid.
        while matches!(self.peek_kind(), TokenKind::Ident(_)) {
            let name = self.expect_ident()?;
            self.expect(&TokenKind::Assign, "'='")?;
            let expr = self.parse_expr()?;
            collect.groups.push((name, expr));
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }

        if self.eat_keyword(Keyword::Aggregate) {
            loop {
                let name = self.expect_ident()?;
                self.expect(&TokenKind::Assign, "'='")?;
                let fn_name = self.expect_ident()?;
                let aggregate = AggregateFn::from_name(&fn_name)
                    .ok_or_else(|| self.error(format!("unknown aggregate '{fn_name}'")))?;
                self.expect(&TokenKind::LParen, "'('")?;
                let arg = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "')'")?;
                collect.aggregates.push((name, aggregate, arg));
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }

        if collect.groups.is_empty() && collect.aggregates.is_empty() {
            return Err(self.error("COLLECT needs group keys or aggregates"));
        }
        Ok(collect)
    }

    // ------------------------------------------------------------------
    // Expressions (precedence climbing)
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> CoreResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_and()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.parse_and()?;
            left = Expr::Binary(BinaryOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_not()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.parse_not()?;
            left = Expr::Binary(BinaryOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> CoreResult<Expr> {
        if self.eat_keyword(Keyword::Not) {
            let inner = self.parse_not()?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> CoreResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek_kind() {
            TokenKind::EqEq => BinaryOp::Eq,
            TokenKind::NotEq => BinaryOp::Neq,
            TokenKind::Lt => BinaryOp::Lt,
            TokenKind::LtEq => BinaryOp::Le,
            TokenKind::Gt => BinaryOp::Gt,
            TokenKind::GtEq => BinaryOp::Ge,
            TokenKind::Keyword(Keyword::In) => BinaryOp::In,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_multiplicative(&mut self) -> CoreResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> CoreResult<Expr> {
        if self.eat(&TokenKind::Minus) {
            let inner = self.parse_unary()?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)));
        }
        let mut expr = self.parse_primary()?;

        // Postfix: field and index access.
        loop {
            if self.eat(&TokenKind::Dot) {
                let field = self.expect_ident()?;
                expr = Expr::Field(Box::new(expr), field);
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.parse_expr()?;
                self.expect(&TokenKind::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> CoreResult<Expr> {
        match self.peek_kind().clone() {
            TokenKind::Int(n) => {
                self.advance();
                Ok(Expr::Literal(Literal::Int(n)))
            }
            TokenKind::Float(f) => {
                self.advance();
                Ok(Expr::Literal(Literal::Float(f)))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal(Literal::Str(s)))
            }
            TokenKind::Param(name) => {
                self.advance();
                Ok(Expr::Param(name))
            }
            TokenKind::Keyword(Keyword::True) => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(true)))
            }
            TokenKind::Keyword(Keyword::False) => {
                self.advance();
                Ok(Expr::Literal(Literal::Bool(false)))
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.advance();
                Ok(Expr::Literal(Literal::Null))
            }
            TokenKind::Keyword(Keyword::Similarity) => self.parse_keyword_call("SIMILARITY"),
            TokenKind::Keyword(Keyword::Proximity) => self.parse_keyword_call("PROXIMITY"),
            TokenKind::Keyword(Keyword::Fulltext) => self.parse_keyword_call("FULLTEXT"),
            TokenKind::Keyword(Keyword::Any) => self.parse_quantified(Quantifier::Any),
            TokenKind::Keyword(Keyword::All) => self.parse_quantified(Quantifier::All),
            TokenKind::Ident(name) => {
                self.advance();
                if self.eat(&TokenKind::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::Call(name.to_ascii_uppercase(), args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            TokenKind::LParen => {
                self.advance();
                // A parenthesized query is a subquery expression.
                let starts_query = matches!(
                    self.peek_kind(),
                    TokenKind::Keyword(Keyword::For)
                        | TokenKind::Keyword(Keyword::Return)
                        | TokenKind::Keyword(Keyword::With)
                        | TokenKind::Keyword(Keyword::Let)
                );
                if starts_query {
                    let query = self.parse_query()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(Expr::Subquery(Box::new(query)))
                } else {
                    let expr = self.parse_expr()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    Ok(expr)
                }
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                if !self.eat(&TokenKind::RBracket) {
                    loop {
                        items.push(self.parse_expr()?);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RBracket, "']'")?;
                }
                Ok(Expr::Array(items))
            }
            TokenKind::LBrace => {
                self.advance();
                let mut fields = Vec::new();
                if !self.eat(&TokenKind::RBrace) {
                    loop {
                        let name = match self.peek_kind().clone() {
                            TokenKind::Ident(name) => {
                                self.advance();
                                name
                            }
                            TokenKind::Str(name) => {
                                self.advance();
                                name
                            }
                            _ => return Err(self.error("expected object key")),
                        };
                        // `{c}` is shorthand for `{c: c}`.
                        let value = if self.eat(&TokenKind::Colon) {
                            self.parse_expr()?
                        } else {
                            Expr::Var(name.clone())
                        };
                        fields.push((name, value));
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(&TokenKind::RBrace, "'}'")?;
                }
                Ok(Expr::Object(fields))
            }
            _ => Err(self.error("expected expression")),
        }
    }

    fn parse_keyword_call(&mut self, name: &str) -> CoreResult<Expr> {
        self.advance();
        self.expect(&TokenKind::LParen, "'('")?;
        let args = self.parse_args()?;
        Ok(Expr::Call(name.to_string(), args))
    }

    fn parse_args(&mut self) -> CoreResult<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn parse_quantified(&mut self, quantifier: Quantifier) -> CoreResult<Expr> {
        self.advance();
        let var = self.expect_ident()?;
        self.expect_keyword(Keyword::In)?;
        let list = self.parse_expr()?;
        self.expect_keyword(Keyword::Satisfies)?;
        let cond = self.parse_expr()?;
        Ok(Expr::Quantified {
            quantifier,
            var,
            list: Box::new(list),
            cond: Box::new(cond),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_return() {
        let query = parse("RETURN 1").unwrap();
        assert!(query.for_nodes.is_empty());
        assert_eq!(query.return_expr, Some(Expr::Literal(Literal::Int(1))));
    }

    #[test]
    fn for_filter_return() {
        let query = parse("FOR u IN users FILTER u.age >= 18 RETURN u.name").unwrap();
        assert_eq!(query.for_nodes.len(), 1);
        assert_eq!(query.for_nodes[0].var, "u");
        assert_eq!(
            query.for_nodes[0].source,
            ForSource::Collection("users".to_string())
        );
        assert_eq!(query.filters.len(), 1);
        match &query.return_expr {
            Some(Expr::Field(base, field)) => {
                assert_eq!(**base, Expr::Var("u".to_string()));
                assert_eq!(field, "name");
            }
            other => panic!("unexpected return: {other:?}"),
        }
    }

    #[test]
    fn collect_aggregate() {
        let query = parse(
            "FOR o IN orders COLLECT c = o.c AGGREGATE s = SUM(o.amt) RETURN {c, s}",
        )
        .unwrap();
        let collect = query.collect.unwrap();
        assert_eq!(collect.groups.len(), 1);
        assert_eq!(collect.groups[0].0, "c");
        assert_eq!(collect.aggregates.len(), 1);
        assert_eq!(collect.aggregates[0].0, "s");
        assert_eq!(collect.aggregates[0].1, AggregateFn::Sum);

        // Shorthand object keys resolve to variables.
        match query.return_expr.unwrap() {
            Expr::Object(fields) => {
                assert_eq!(fields[0].1, Expr::Var("c".to_string()));
                assert_eq!(fields[1].1, Expr::Var("s".to_string()));
            }
            other => panic!("unexpected return: {other:?}"),
        }
    }

    #[test]
    fn hybrid_vector_geo() {
        let query = parse(
            "FOR h IN hotels FILTER ST_Within(h.geo, @bbox) \
             SORT SIMILARITY(h.emb, @q) DESC LIMIT 3 RETURN h",
        )
        .unwrap();
        assert_eq!(query.filters.len(), 1);
        match &query.filters[0] {
            Expr::Call(name, args) => {
                assert_eq!(name, "ST_WITHIN");
                assert_eq!(args.len(), 2);
                assert_eq!(args[1], Expr::Param("bbox".to_string()));
            }
            other => panic!("unexpected filter: {other:?}"),
        }
        assert_eq!(query.sort.len(), 1);
        assert!(query.sort[0].descending);
        match &query.sort[0].expr {
            Expr::Call(name, _) => assert_eq!(name, "SIMILARITY"),
            other => panic!("unexpected sort: {other:?}"),
        }
        assert_eq!(query.limit, Some(Limit { offset: 0, count: 3 }));
    }

    #[test]
    fn with_cte_and_variable_source() {
        let query = parse(
            "WITH adults AS (FOR u IN users FILTER u.age >= 18 RETURN u) \
             FOR a IN adults RETURN a.name",
        )
        .unwrap();
        assert_eq!(query.with.len(), 1);
        assert_eq!(query.with[0].name, "adults");
        assert_eq!(
            query.for_nodes[0].source,
            ForSource::Variable("adults".to_string())
        );
    }

    #[test]
    fn subquery_expression() {
        let query = parse(
            "FOR u IN users LET orders = (FOR o IN orders FILTER o.user == u.pk RETURN o) \
             RETURN {u, n: orders}",
        )
        .unwrap();
        assert_eq!(query.lets.len(), 1);
        assert!(matches!(query.lets[0].expr, Expr::Subquery(_)));
    }

    #[test]
    fn traversal_sources() {
        let query = parse("FOR v IN OUTBOUND 'users:alice' follows RETURN v").unwrap();
        match &query.for_nodes[0].source {
            ForSource::Traversal {
                direction,
                edges,
                min_depth,
                max_depth,
                ..
            } => {
                assert_eq!(*direction, Direction::Outbound);
                assert_eq!(edges, "follows");
                assert_eq!((*min_depth, *max_depth), (1, 1));
            }
            other => panic!("unexpected source: {other:?}"),
        }

        let query = parse("FOR v IN 1..3 INBOUND @start follows RETURN v").unwrap();
        match &query.for_nodes[0].source {
            ForSource::Traversal {
                direction,
                min_depth,
                max_depth,
                ..
            } => {
                assert_eq!(*direction, Direction::Inbound);
                assert_eq!((*min_depth, *max_depth), (1, 3));
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn shortest_path() {
        let query =
            parse("FOR v IN OUTBOUND SHORTEST_PATH 'users:a' TO 'users:b' follows RETURN v")
                .unwrap();
        match &query.for_nodes[0].source {
            ForSource::ShortestPath { direction, edges, .. } => {
                assert_eq!(*direction, Direction::Outbound);
                assert_eq!(edges, "follows");
            }
            other => panic!("unexpected source: {other:?}"),
        }
    }

    #[test]
    fn quantified_expression() {
        let query =
            parse("FOR u IN users FILTER ANY t IN u.tags SATISFIES t == 'vip' RETURN u")
                .unwrap();
        match &query.filters[0] {
            Expr::Quantified { quantifier, var, .. } => {
                assert_eq!(*quantifier, Quantifier::Any);
                assert_eq!(var, "t");
            }
            other => panic!("unexpected filter: {other:?}"),
        }
    }

    #[test]
    fn operator_precedence() {
        let query = parse("RETURN 1 + 2 * 3 == 7 AND TRUE").unwrap();
        // ((1 + (2*3)) == 7) AND TRUE
        match query.return_expr.unwrap() {
            Expr::Binary(BinaryOp::And, left, right) => {
                assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
                assert_eq!(*right, Expr::Literal(Literal::Bool(true)));
            }
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn index_access_first_or_null() {
        let query = parse("RETURN (FOR u IN users RETURN u)[0]").unwrap();
        match query.return_expr.unwrap() {
            Expr::Index(base, index) => {
                assert!(matches!(*base, Expr::Subquery(_)));
                assert_eq!(*index, Expr::Literal(Literal::Int(0)));
            }
            other => panic!("unexpected expr: {other:?}"),
        }
    }

    #[test]
    fn limit_with_offset() {
        let query = parse("FOR u IN users LIMIT 10, 5 RETURN u").unwrap();
        assert_eq!(query.limit, Some(Limit { offset: 10, count: 5 }));
    }

    #[test]
    fn parse_errors_carry_position() {
        for bad in [
            "FOR",
            "FOR u users RETURN u",
            "FOR u IN users",
            "RETURN",
            "FOR u IN users FILTER RETURN u",
            "FOR u IN users LIMIT -1 RETURN u",
            "FOR u IN users COLLECT RETURN 1",
            "RETURN 1 extra",
        ] {
            let err = parse(bad).unwrap_err();
            assert_eq!(err.kind(), "Parse", "input: {bad}");
        }
    }

    #[test]
    fn fulltext_and_proximity_calls() {
        let query = parse(
            "FOR d IN docs FILTER FULLTEXT(d.body, 'rust database') \
             AND PROXIMITY(d.loc, @p) < 10 RETURN d",
        )
        .unwrap();
        assert_eq!(query.filters.len(), 1);
    }
}
